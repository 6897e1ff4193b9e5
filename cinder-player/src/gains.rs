//! Stereo gain split and volume-ramp setup.
//!
//! Turns a voice's 14-bit final volume and 0-256 final panning into the
//! left/right integer gains the mix loop multiplies by, and arms the linear
//! ramp that walks the old gains to the new ones without clicks. Gains are
//! clipped to 16 bits and attenuated so 32 simultaneous full-volume voices
//! cannot overflow the 32-bit accumulator.

use crate::voice::Voice;
use crate::{MixerConfig, MixerFlags, MIXING_ATTENUATION, VOLUME_RAMP_PRECISION};

/// Compute target gains and ramp state for one voice. Runs once per tick,
/// right before the voice enters the mix list.
pub(crate) fn update_voice_gains(
    voice: &mut Voice,
    config: &MixerConfig,
    master_vol: i32,
    ramp_samples: u32,
    buffer_count: u32,
) {
    if config.channels < 2 {
        voice.right_volume_new = (voice.final_volume * master_vol) >> 8;
        voice.left_volume_new = voice.right_volume_new;
    } else if voice.surround && !config.flags.contains(MixerFlags::NO_SURROUND) {
        // Dolby Pro-Logic trick: an inverted left channel decodes as the
        // rear speaker.
        voice.right_volume_new = (voice.final_volume * master_vol) >> 8;
        voice.left_volume_new = -voice.right_volume_new;
    } else {
        let mut pan = ((voice.final_panning - 128) * config.stereo_separation as i32) / 128;
        pan = (pan + 128).clamp(0, 256);
        if config.flags.contains(MixerFlags::REVERSE_STEREO) {
            pan = 256 - pan;
        }
        let realvol = (voice.final_volume * master_vol) >> 7;
        voice.left_volume_new = (realvol * pan) >> 8;
        voice.right_volume_new = (realvol * (256 - pan)) >> 8;
    }

    voice.right_volume_new = voice.right_volume_new.min(0xFFFF);
    voice.left_volume_new = voice.left_volume_new.min(0xFFFF);

    voice.right_volume_new >>= MIXING_ATTENUATION;
    voice.left_volume_new >>= MIXING_ATTENUATION;
    voice.right_ramp = 0;
    voice.left_ramp = 0;

    // Ping-pong plays the data backwards on the return leg.
    if voice.reverse {
        voice.increment = -voice.increment;
    }

    let ramping_on = !config.flags.contains(MixerFlags::NO_RAMPING);

    if voice.muted {
        voice.left_volume = 0;
        voice.right_volume = 0;
    } else if ramping_on
        && voice.ramp_enabled
        && (voice.right_volume != voice.right_volume_new
            || voice.left_volume != voice.left_volume_new)
    {
        let mut ramp_length = ramp_samples as i32;
        let right_delta =
            (voice.right_volume_new - voice.right_volume) << VOLUME_RAMP_PRECISION;
        let left_delta = (voice.left_volume_new - voice.left_volume) << VOLUME_RAMP_PRECISION;

        if config.flags.contains(MixerFlags::HQ_RAMPING)
            && (voice.right_volume | voice.left_volume) != 0
            && (voice.right_volume_new | voice.left_volume_new) != 0
            && !voice.fast_ramp
        {
            // Stretch the ramp across the tick; bounded below so very short
            // ticks still get a smooth ramp and above by the normal length.
            ramp_length = buffer_count as i32;
            let lo = 1 << (VOLUME_RAMP_PRECISION - 1);
            let hi = ramp_samples as i32;
            if ramp_length < lo {
                ramp_length = lo;
            } else if ramp_length > hi {
                ramp_length = hi;
            }
        }

        voice.right_ramp = right_delta / ramp_length;
        voice.left_ramp = left_delta / ramp_length;
        // Rewind the current gains so ramp_length steps land exactly on the
        // target, with the division remainder absorbed up front.
        voice.right_volume =
            voice.right_volume_new - ((voice.right_ramp * ramp_length) >> VOLUME_RAMP_PRECISION);
        voice.left_volume =
            voice.left_volume_new - ((voice.left_ramp * ramp_length) >> VOLUME_RAMP_PRECISION);

        if (voice.right_ramp | voice.left_ramp) != 0 {
            voice.ramp_length = ramp_length;
        } else {
            voice.ramp_enabled = false;
            voice.right_volume = voice.right_volume_new;
            voice.left_volume = voice.left_volume_new;
        }
    } else {
        voice.ramp_enabled = false;
        voice.right_volume = voice.right_volume_new;
        voice.left_volume = voice.left_volume_new;
    }

    voice.right_ramp_volume = voice.right_volume << VOLUME_RAMP_PRECISION;
    voice.left_ramp_volume = voice.left_volume << VOLUME_RAMP_PRECISION;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_voice() -> Voice {
        Voice {
            final_volume: 1 << 13, // half scale, 14-bit
            final_panning: 128,
            ramp_enabled: true,
            ..Default::default()
        }
    }

    fn config() -> MixerConfig {
        MixerConfig::default()
    }

    #[test]
    fn centered_pan_splits_evenly() {
        let mut v = loud_voice();
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert_eq!(v.left_volume_new, v.right_volume_new);
        assert!(v.left_volume_new > 0);
    }

    #[test]
    fn hard_pan_silences_one_side() {
        let mut v = loud_voice();
        v.final_panning = 0;
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert_eq!(v.left_volume_new, 0);
        assert!(v.right_volume_new > 0);

        let mut v = loud_voice();
        v.final_panning = 256;
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert_eq!(v.right_volume_new, 0);
        assert!(v.left_volume_new > 0);
    }

    #[test]
    fn zero_separation_collapses_to_center() {
        let mut hard_left = loud_voice();
        hard_left.final_panning = 0;
        let mut cfg = config();
        cfg.stereo_separation = 0;
        update_voice_gains(&mut hard_left, &cfg, 0x100, 64, 882);
        assert_eq!(hard_left.left_volume_new, hard_left.right_volume_new);
    }

    #[test]
    fn surround_negates_left() {
        let mut v = loud_voice();
        v.surround = true;
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert_eq!(v.left_volume_new, -v.right_volume_new);
        assert!(v.right_volume_new > 0);
    }

    #[test]
    fn mute_forces_zero_gains() {
        let mut v = loud_voice();
        v.muted = true;
        v.left_volume = 500;
        v.right_volume = 500;
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert_eq!(v.left_volume, 0);
        assert_eq!(v.right_volume, 0);
    }

    #[test]
    fn ramp_reaches_target_exactly() {
        let mut v = loud_voice();
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert!(v.ramp_length > 0, "gain change arms a ramp");

        // Walk the ramp the way the mix loop does.
        let mut l = v.left_ramp_volume;
        let mut r = v.right_ramp_volume;
        for _ in 0..v.ramp_length {
            l += v.left_ramp;
            r += v.right_ramp;
        }
        assert_eq!(l >> VOLUME_RAMP_PRECISION, v.left_volume_new);
        assert_eq!(r >> VOLUME_RAMP_PRECISION, v.right_volume_new);
    }

    #[test]
    fn equal_gains_disable_ramping() {
        let mut v = loud_voice();
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        let (l, r) = (v.left_volume_new, v.right_volume_new);
        v.left_volume = l;
        v.right_volume = r;
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert!(!v.ramp_enabled);
        assert_eq!(v.ramp_length, 0);
    }

    #[test]
    fn reverse_negates_increment() {
        let mut v = loud_voice();
        v.increment = 0x8000;
        v.reverse = true;
        update_voice_gains(&mut v, &config(), 0x100, 64, 882);
        assert_eq!(v.increment, -0x8000);
    }
}
