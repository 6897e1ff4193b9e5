//! The mix core: resamples every listed voice into the stereo accumulator.
//!
//! One generic inner loop replaces the old per-format assembly variants:
//! it is monomorphized over the PCM element type (8/16-bit) and channel
//! layout (mono/stereo), with interpolation, ramping, and filtering as
//! runtime branches. Positions are 16.16 fixed point carried as a whole
//! frame index plus a 16-bit fraction.
//!
//! When a voice stops, its contribution to the final mixed frame is parked
//! as a DC offset that decays exponentially into the following buffers;
//! that, plus the volume ramps, is what keeps note cuts click-free.

use crate::player::Player;
use crate::voice::Voice;
use crate::{Interpolation, LoopKind, MixerFlags, VOLUME_RAMP_PRECISION};

/// Ping-pong loops reflect one frame short of the boundary, like the
/// classic trackers' sound drivers (noticeable only on tiny chip loops).
const PINGPONG_OFFSET: i32 = 1;

/// PCM element readable as a left-aligned 16-bit value.
pub(crate) trait Pcm: Copy {
    fn to16(self) -> i32;
}

impl Pcm for i8 {
    #[inline]
    fn to16(self) -> i32 {
        (self as i32) << 8
    }
}

impl Pcm for i16 {
    #[inline]
    fn to16(self) -> i32 {
        self as i32
    }
}

/// Advance a voice's 16.16 position by `frames` steps of its increment.
#[inline]
pub(crate) fn advance_position(voice: &mut Voice, frames: i32) {
    let cur = ((voice.position as i64) << 16) | (voice.position_frac as i64 & 0xFFFF);
    let next = cur + voice.increment as i64 * frames as i64;
    voice.position = (next >> 16) as i32;
    voice.position_frac = (next & 0xFFFF) as u32;
}

/// Normalize the play position against the loop bounds (wrapping forward
/// loops, reflecting ping-pong loops) and return how many frames can mix
/// before the next boundary. Zero means the voice has run out.
pub(crate) fn get_sample_count(voice: &mut Voice, samples: i32) -> i32 {
    let loop_start = if voice.loop_kind.is_loop() {
        voice.loop_start as i32
    } else {
        0
    };
    let mut inc = voice.increment;
    if samples <= 0 || inc == 0 || voice.length == 0 {
        return 0;
    }
    let length = voice.length as i32;

    if voice.position < loop_start {
        if inc < 0 {
            // Reflect a backward overshoot off the loop start.
            let delta = ((loop_start - voice.position) << 16) - (voice.position_frac as i32 & 0xFFFF);
            voice.position = loop_start + (delta >> 16);
            voice.position_frac = (delta & 0xFFFF) as u32;
            if voice.position < loop_start || voice.position >= (loop_start + length) / 2 {
                voice.position = loop_start;
                voice.position_frac = 0;
            }
            inc = -inc;
            voice.increment = inc;
            voice.reverse = false;
            if !voice.loop_kind.is_loop() || voice.position >= length {
                voice.position = length;
                voice.position_frac = 0;
                return 0;
            }
        } else if voice.position < 0 {
            voice.position = 0;
        }
    } else if voice.position >= length {
        if !voice.loop_kind.is_loop() {
            return 0;
        }
        if voice.loop_kind == LoopKind::PingPong {
            // Turn around at the end.
            if inc > 0 {
                inc = -inc;
                voice.increment = inc;
            }
            voice.reverse = true;
            let cur = ((voice.position as i64) << 16) | (voice.position_frac as i64 & 0xFFFF);
            let overshoot = cur - ((length as i64) << 16);
            let reflected = (((length - PINGPONG_OFFSET) as i64) << 16) - overshoot;
            voice.position = (reflected >> 16) as i32;
            voice.position_frac = (reflected & 0xFFFF) as u32;
            if voice.position <= loop_start || voice.position >= length {
                voice.position = length - PINGPONG_OFFSET;
                voice.position_frac = 0;
            }
        } else {
            if inc < 0 {
                // Should not happen on a forward loop; recover anyway.
                inc = -inc;
                voice.increment = inc;
            }
            voice.position += loop_start - length;
            if voice.position < loop_start {
                voice.position = loop_start;
            }
        }
    }

    let pos = voice.position;
    if pos < loop_start && (pos < 0 || inc < 0) {
        return 0;
    }
    if pos < 0 || pos >= length {
        return 0;
    }

    let inv = inc.unsigned_abs();
    // Keep single spans small enough that position math stays in range.
    let max_samples = (16384 / ((inv >> 16) + 1)).max(2) as i32;
    let mut sample_count = samples.min(max_samples);

    let cur = ((pos as i64) << 16) | (voice.position_frac as i64 & 0xFFFF);
    let dest = cur + inc as i64 * (sample_count - 1) as i64;
    let dest_whole = (dest >> 16) as i32;

    if inc < 0 {
        if dest_whole < loop_start {
            sample_count = ((cur - ((loop_start as i64) << 16) - 1) / inv as i64) as i32 + 1;
        }
    } else if dest_whole >= length {
        sample_count = ((((length as i64) << 16) - cur - 1) / inv as i64) as i32 + 1;
    }

    sample_count.clamp(1, samples)
}

/// The resampling inner loop: `buf` is one span of interleaved stereo
/// accumulator samples, `frames = buf.len() / 2`.
fn mix_span<T: Pcm, const STEREO: bool>(
    voice: &mut Voice,
    data: &[T],
    buf: &mut [i32],
    linear: bool,
    ramping: bool,
) {
    let frames = buf.len() / 2;
    let data_frames = if STEREO { data.len() / 2 } else { data.len() };
    if data_frames == 0 {
        return;
    }
    let last = data_frames - 1;

    let filtering = voice.filter_on;
    let (a0, b0, b1) = (voice.filter_a0, voice.filter_b0, voice.filter_b1);
    let mut fy = voice.filter_y;

    let mut pos = ((voice.position as i64) << 16) | (voice.position_frac as i64 & 0xFFFF);
    let inc = voice.increment as i64;
    let mut right_ramp_volume = voice.right_ramp_volume;
    let mut left_ramp_volume = voice.left_ramp_volume;

    for frame in 0..frames {
        let whole = ((pos >> 16) as i32).clamp(0, last as i32) as usize;
        let poslo = ((pos >> 8) & 0xFF) as i32;

        let (mut vol_l, mut vol_r) = if STEREO {
            let l0 = data[whole * 2].to16();
            let r0 = data[whole * 2 + 1].to16();
            if linear {
                let next = (whole + 1).min(last);
                let l1 = data[next * 2].to16();
                let r1 = data[next * 2 + 1].to16();
                (l0 + ((poslo * (l1 - l0)) >> 8), r0 + ((poslo * (r1 - r0)) >> 8))
            } else {
                (l0, r0)
            }
        } else {
            let s0 = data[whole].to16();
            let v = if linear {
                let s1 = data[(whole + 1).min(last)].to16();
                s0 + ((poslo * (s1 - s0)) >> 8)
            } else {
                s0
            };
            (v, v)
        };

        if filtering {
            vol_l = crate::filter::filter_sample(vol_l, a0, b0, b1, &mut fy[0]);
            if STEREO {
                vol_r = crate::filter::filter_sample(vol_r, a0, b0, b1, &mut fy[1]);
            } else {
                vol_r = vol_l;
            }
        }

        let (gain_r, gain_l) = if ramping {
            left_ramp_volume += voice.left_ramp;
            right_ramp_volume += voice.right_ramp;
            (
                right_ramp_volume >> VOLUME_RAMP_PRECISION,
                left_ramp_volume >> VOLUME_RAMP_PRECISION,
            )
        } else {
            (voice.right_volume, voice.left_volume)
        };

        // Even slot carries the right-gain product; the whole engine is
        // consistently "swapped" this way and output order follows it.
        buf[frame * 2] += vol_l * gain_r;
        buf[frame * 2 + 1] += vol_r * gain_l;

        pos += inc;
    }

    voice.position = (pos >> 16) as i32;
    voice.position_frac = (pos & 0xFFFF) as u32;
    voice.filter_y = fy;
    if ramping {
        voice.right_ramp_volume = right_ramp_volume;
        voice.right_volume = right_ramp_volume >> VOLUME_RAMP_PRECISION;
        voice.left_ramp_volume = left_ramp_volume;
        voice.left_volume = left_ramp_volume >> VOLUME_RAMP_PRECISION;
    }
}

/// Decay a stopped voice's parked DC offsets into a buffer span.
fn end_voice_ofs(voice: &mut Voice, buf: &mut [i32], frames: usize) {
    let mut rofs = voice.rofs;
    let mut lofs = voice.lofs;
    if rofs == 0 && lofs == 0 {
        return;
    }
    for frame in 0..frames {
        let x_r = crate::output::ofs_decay(rofs);
        let x_l = crate::output::ofs_decay(lofs);
        rofs -= x_r;
        lofs -= x_l;
        buf[frame * 2] += x_r;
        buf[frame * 2 + 1] += x_l;
    }
    voice.rofs = rofs;
    voice.lofs = lofs;
}

impl Player {
    /// Mix every listed voice into the first `count` frames of the mix
    /// buffer. Returns the number of voices that contributed.
    pub(crate) fn create_stereo_mix(&mut self, count: usize) -> u32 {
        if count == 0 {
            return 0;
        }
        let direct = self.config.flags.contains(MixerFlags::DIRECT_TO_DISK);
        let max_voices = self.config.max_voices as usize;
        let mut nchused = 0u32;
        let mut nchmixed = 0usize;

        for mix_idx in 0..self.voice_mix.len() {
            let vidx = self.voice_mix[mix_idx];
            {
                let v = &self.voices[vidx];
                if v.sample.is_none() && v.lofs == 0 && v.rofs == 0 {
                    continue;
                }
            }
            nchused += 1;

            let mut naddmix = 0usize;
            let mut nsamples = count as i32;
            let mut buf_off = 0usize; // in interleaved samples

            loop {
                let mut nrampsamples = nsamples;
                {
                    let v = &self.voices[vidx];
                    if v.ramp_length > 0 && nrampsamples > v.ramp_length {
                        nrampsamples = v.ramp_length;
                    }
                }

                let smpcount = get_sample_count(&mut self.voices[vidx], nrampsamples);
                if smpcount <= 0 {
                    // The voice ran out: stop it and let its final frame
                    // decay into the remainder of the buffer.
                    let v = &mut self.voices[vidx];
                    v.length = 0;
                    v.position = 0;
                    v.position_frac = 0;
                    v.ramp_length = 0;
                    end_voice_ofs(v, &mut self.mix_buffer[buf_off..], nsamples as usize);
                    self.dry_rofs += v.rofs;
                    self.dry_lofs += v.lofs;
                    v.rofs = 0;
                    v.lofs = 0;
                    v.reverse = false;
                    break;
                }

                let inaudible = {
                    let v = &self.voices[vidx];
                    v.ramp_length == 0 && v.left_volume == 0 && v.right_volume == 0
                };

                if (nchmixed >= max_voices && !direct) || inaudible {
                    // Advance without mixing; the voice stays alive.
                    let v = &mut self.voices[vidx];
                    advance_position(v, smpcount);
                    v.rofs = 0;
                    v.lofs = 0;
                    buf_off += smpcount as usize * 2;
                } else {
                    let song = &self.song;
                    let config = &self.config;
                    let v = &mut self.voices[vidx];
                    let span =
                        &mut self.mix_buffer[buf_off..buf_off + smpcount as usize * 2];

                    if let Some(smp) = v.sample.and_then(|s| song.sample(s)) {
                        let linear = match config.interpolation {
                            Interpolation::Nearest => false,
                            Interpolation::Linear => v.increment != 0x10000,
                        };
                        let ramping = v.ramp_length > 0;

                        let before_r = span[span.len() - 2];
                        let before_l = span[span.len() - 1];

                        match &smp.data {
                            cinder_song::SampleData::Mono8(d) => {
                                mix_span::<i8, false>(v, d, span, linear, ramping)
                            }
                            cinder_song::SampleData::Mono16(d) => {
                                mix_span::<i16, false>(v, d, span, linear, ramping)
                            }
                            cinder_song::SampleData::Stereo8(d) => {
                                mix_span::<i8, true>(v, d, span, linear, ramping)
                            }
                            cinder_song::SampleData::Stereo16(d) => {
                                mix_span::<i16, true>(v, d, span, linear, ramping)
                            }
                        }

                        // Park this span's final-frame contribution as the
                        // next click-suppression offset.
                        v.rofs = span[span.len() - 2] - before_r;
                        v.lofs = span[span.len() - 1] - before_l;
                        naddmix = 1;
                    }
                    buf_off += smpcount as usize * 2;
                }

                nsamples -= smpcount;

                let v = &mut self.voices[vidx];
                if v.ramp_length > 0 {
                    if v.ramp_length <= smpcount {
                        // Ramp done; snap to the target gains.
                        v.ramp_length = 0;
                        v.right_volume = v.right_volume_new;
                        v.left_volume = v.left_volume_new;
                        v.right_ramp = 0;
                        v.left_ramp = 0;
                        if v.note_fade && v.fadeout_volume == 0 {
                            v.length = 0;
                            v.sample = None;
                        }
                    } else {
                        v.ramp_length -= smpcount;
                    }
                }

                if nsamples <= 0 {
                    break;
                }
            }

            nchmixed += naddmix;
        }
        nchused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice_with(length: u32, increment: i32) -> Voice {
        Voice {
            length,
            increment,
            sample: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn sample_count_stops_at_end() {
        let mut v = voice_with(100, 0x10000);
        v.position = 90;
        assert_eq!(get_sample_count(&mut v, 64), 10);
        v.position = 100;
        assert_eq!(get_sample_count(&mut v, 64), 0, "past the end, no loop");
    }

    #[test]
    fn sample_count_wraps_forward_loop() {
        let mut v = voice_with(100, 0x10000);
        v.loop_kind = LoopKind::Forward;
        v.loop_start = 50;
        v.loop_end = 100;
        v.position = 104; // overshot the end by 4
        let n = get_sample_count(&mut v, 64);
        assert_eq!(v.position, 54, "wrapped into the loop");
        assert_eq!(n, 46, "runs to the loop end");
    }

    #[test]
    fn sample_count_reflects_pingpong() {
        let mut v = voice_with(100, 0x10000);
        v.loop_kind = LoopKind::PingPong;
        v.loop_start = 0;
        v.loop_end = 100;
        v.position = 102;
        let n = get_sample_count(&mut v, 10);
        assert!(v.reverse, "now playing backwards");
        assert!(v.increment < 0);
        assert!(v.position < 100 && v.position > 90, "reflected: {}", v.position);
        assert!(n > 0);
    }

    #[test]
    fn fractional_increment_spans_full_request() {
        let mut v = voice_with(1000, 0x8000); // half speed
        assert_eq!(get_sample_count(&mut v, 64), 64);
        advance_position(&mut v, 64);
        assert_eq!(v.position, 32);
        assert_eq!(v.position_frac, 0);
    }

    #[test]
    fn mix_span_accumulates_with_gain() {
        let data: Vec<i16> = vec![1000; 32];
        let mut v = voice_with(32, 0x10000);
        v.left_volume = 64;
        v.right_volume = 128;
        let mut buf = vec![0i32; 16];
        mix_span::<i16, false>(&mut v, &data, &mut buf, false, false);
        // Even slots carry the right gain, odd the left.
        assert_eq!(buf[0], 1000 * 128);
        assert_eq!(buf[1], 1000 * 64);
        assert_eq!(v.position, 8);
    }

    #[test]
    fn mix_span_linear_interpolates() {
        let data: Vec<i16> = vec![0, 256];
        let mut v = voice_with(2, 0x8000); // half-frame steps
        v.left_volume = 1;
        v.right_volume = 1;
        let mut buf = vec![0i32; 4];
        mix_span::<i16, false>(&mut v, &data, &mut buf, true, false);
        assert_eq!(buf[0], 0, "exactly on the first sample");
        assert_eq!(buf[2], 128, "half way between the two samples");
    }

    #[test]
    fn ramped_span_walks_gain() {
        let data: Vec<i16> = vec![1 << 14; 64];
        let mut v = voice_with(64, 0x10000);
        v.ramp_length = 16;
        v.left_ramp = 1 << VOLUME_RAMP_PRECISION;
        v.right_ramp = 1 << VOLUME_RAMP_PRECISION;
        let mut buf = vec![0i32; 32];
        mix_span::<i16, false>(&mut v, &data, &mut buf, false, true);
        // Gain grows by one per frame starting from zero.
        assert_eq!(buf[0], (1 << 14) * 1);
        assert_eq!(buf[30], (1 << 14) * 16);
        assert_eq!(v.left_volume, 16);
    }
}
