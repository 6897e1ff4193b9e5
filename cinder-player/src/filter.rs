//! Per-voice resonant lowpass filter.
//!
//! The classic two-pole design: cutoff 0-127 maps exponentially onto
//! 110 Hz..~21 kHz, resonance 0-127 through a damping table. Coefficients
//! are fixed-point ([`crate::FILTER_PRECISION`] fractional bits) and the
//! two delay taps per side live in the voice; the mix loop applies the
//! difference equation inline.

use crate::voice::Voice;
use crate::FILTER_PRECISION;

/// 2x damping factor per resonance step (0.5 dB each).
const RESONANCE_TABLE: [f32; 128] = [
    1.000_000_0, 0.978_644_6, 0.957_745_3, 0.937_292_2,
    0.917_275_9, 0.897_687_1, 0.878_516_7, 0.859_755_6,
    0.841_395_1, 0.823_426_8, 0.805_842_2, 0.788_633_1,
    0.771_791_5, 0.755_309_6, 0.739_179_7, 0.723_394_2,
    0.707_945_8, 0.692_827_3, 0.678_031_7, 0.663_552_0,
    0.649_381_6, 0.635_513_8, 0.621_942_2, 0.608_660_3,
    0.595_662_1, 0.582_941_5, 0.570_492_6, 0.558_309_5,
    0.546_386_5, 0.534_718_2, 0.523_299_1, 0.512_123_8,
    0.501_187_2, 0.490_484_2, 0.480_009_7, 0.469_758_9,
    0.459_727_0, 0.449_909_3, 0.440_301_3, 0.430_898_5,
    0.421_696_5, 0.412_691_0, 0.403_877_8, 0.395_252_9,
    0.386_812_1, 0.378_551_5, 0.370_467_4, 0.362_555_9,
    0.354_813_4, 0.347_236_2, 0.339_820_8, 0.332_563_8,
    0.325_461_8, 0.318_511_4, 0.311_709_5, 0.305_052_8,
    0.298_538_3, 0.292_162_9, 0.285_923_6, 0.279_817_6,
    0.273_842_0, 0.267_994_0, 0.262_270_8, 0.256_669_9,
    0.251_188_6, 0.245_824_4, 0.240_574_7, 0.235_437_2,
    0.230_409_3, 0.225_488_8, 0.220_673_4, 0.215_960_8,
    0.211_348_9, 0.206_835_5, 0.202_418_4, 0.198_095_7,
    0.193_865_3, 0.189_725_2, 0.185_673_5, 0.181_708_4,
    0.177_827_9, 0.174_030_3, 0.170_313_9, 0.166_676_7,
    0.163_117_3, 0.159_633_9, 0.156_224_8, 0.152_888_6,
    0.149_623_6, 0.146_428_3, 0.143_301_3, 0.140_241_0,
    0.137_246_1, 0.134_315_1, 0.131_446_8, 0.128_639_7,
    0.125_892_5, 0.123_204_1, 0.120_573_0, 0.117_998_1,
    0.115_478_2, 0.113_012_1, 0.110_598_7, 0.108_236_8,
    0.105_925_4, 0.103_663_3, 0.101_449_5, 0.099_283_0,
    0.097_162_8, 0.095_087_8, 0.093_057_2, 0.091_069_9,
    0.089_125_1, 0.087_221_8, 0.085_359_1, 0.083_536_3,
    0.081_752_3, 0.080_006_5, 0.078_297_9, 0.076_625_8,
    0.074_989_4, 0.073_388_0, 0.071_820_8, 0.070_287_0,
    0.068_786_0, 0.067_317_0, 0.065_879_5, 0.064_472_6,
];

const FREQ_PARAM_MULT: f32 = 128.0 / (24.0 * 256.0);

/// Recompute the filter coefficients for a voice.
///
/// `flt_modifier` is the filter envelope value (±256); the effective cutoff
/// is `cutoff * (modifier + 256) / 256`. A wide-open filter with no
/// resonance on a fresh note turns filtering off entirely; in every other
/// case the coefficients just update in place, keeping the delay taps
/// unless `reset` asks for a clean start.
pub(crate) fn setup_voice_filter(voice: &mut Voice, reset: bool, flt_modifier: i32, sample_rate: i32) {
    let cutoff = ((voice.cutoff as i32 * (flt_modifier + 256)) / 256).min(255);
    let resonance = (voice.resonance as i32).min(255).min(127);

    if resonance == 0 && cutoff >= 254 {
        if voice.fresh_note {
            // A wide-open Z7F next to a note disables the filter; mid-note
            // it must keep running or the taps would click.
            voice.filter_on = false;
        }
        return;
    }
    voice.filter_on = true;

    let mut frequency = 110.0_f32 * (2.0_f32).powf(cutoff as f32 * FREQ_PARAM_MULT + 0.25);
    if frequency > sample_rate as f32 / 2.0 {
        frequency = sample_rate as f32 / 2.0;
    }
    let r = sample_rate as f32 / (2.0 * std::f32::consts::PI * frequency);

    let res = RESONANCE_TABLE[resonance as usize];
    let d = res * r + res - 1.0;
    let e = r * r;

    let fg = 1.0 / (1.0 + d + e);
    let fb0 = (d + e + e) / (1.0 + d + e);
    let fb1 = -e / (1.0 + d + e);

    let scale = (1_i64 << FILTER_PRECISION) as f32;
    voice.filter_a0 = (fg * scale) as i32;
    voice.filter_b0 = (fb0 * scale) as i32;
    voice.filter_b1 = (fb1 * scale) as i32;

    if reset {
        voice.filter_y = [[0; 2]; 2];
    }
}

/// One step of the difference equation for one side, 64-bit accumulated.
#[inline]
pub(crate) fn filter_sample(vol: i32, a0: i32, b0: i32, b1: i32, y: &mut [i32; 2]) -> i32 {
    let clip = |x: i32| x.clamp(-65536, 65534);
    let out = ((vol as i64 * a0 as i64
        + clip(y[0]) as i64 * b0 as i64
        + clip(y[1]) as i64 * b1 as i64
        + (1_i64 << (FILTER_PRECISION - 1)))
        >> FILTER_PRECISION) as i32;
    y[1] = y[0];
    y[0] = out;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_open_filter_disables_on_fresh_note() {
        let mut v = Voice {
            cutoff: 127,
            resonance: 0,
            fresh_note: true,
            filter_on: true,
            ..Default::default()
        };
        setup_voice_filter(&mut v, true, 256, 44100);
        assert!(!v.filter_on);

        // Mid-note the same settings keep the filter running.
        v.fresh_note = false;
        v.filter_on = true;
        setup_voice_filter(&mut v, true, 256, 44100);
        assert!(v.filter_on);
    }

    #[test]
    fn coefficients_are_sane() {
        let mut v = Voice {
            cutoff: 60,
            resonance: 40,
            ..Default::default()
        };
        setup_voice_filter(&mut v, true, 0, 44100);
        assert!(v.filter_on);
        assert!(v.filter_a0 > 0);
        // A lowpass at unity gain: a0 + b0 + b1 ~ 1.0 in fixed point.
        let sum = v.filter_a0 as i64 + v.filter_b0 as i64 + v.filter_b1 as i64;
        let unity = 1_i64 << FILTER_PRECISION;
        assert!((sum - unity).abs() < unity / 100, "dc gain near unity: {sum}");
    }

    #[test]
    fn dc_passes_through_lowpass() {
        let mut v = Voice {
            cutoff: 40,
            resonance: 0,
            ..Default::default()
        };
        setup_voice_filter(&mut v, true, 0, 44100);
        let mut y = [0i32; 2];
        let mut out = 0;
        for _ in 0..2000 {
            out = filter_sample(10_000, v.filter_a0, v.filter_b0, v.filter_b1, &mut y);
        }
        assert!((out - 10_000).abs() < 200, "settled near input: {out}");
    }
}
