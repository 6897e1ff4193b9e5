//! Cinder-Player: real-time pattern playback and mixing engine.
//!
//! The player walks a [`cinder_song::Song`]'s order list tick by tick, runs
//! the per-voice modulation pipeline (envelopes, vibrato, tremolo, panbrello,
//! arpeggio, auto-vibrato), and mixes the active voices into a fixed-point
//! stereo buffer that is clipped down to the caller's output format. The
//! render path never allocates: the voice pool, mix buffer, and conversion
//! scratch all live in [`Player`] and are sized at configure time.
//!
//! The same [`Player::render`] call drives both live output (see [`backend`])
//! and offline export (see [`export`]); the two paths are bit-identical by
//! construction.
//!
//! Fixed-point conventions, kept throughout for compatibility with the
//! classic trackers this engine reproduces:
//! - voice volume: 14 bits (note volume 0-256 shifted left by 6)
//! - resample increment: 16.16
//! - channel gains: 16-bit, attenuated by [`MIXING_ATTENUATION`]
//! - volume ramps: gains extended by [`VOLUME_RAMP_PRECISION`] fractional bits
//! - mix accumulator: 32-bit, clipped to 27 bits on output

mod backend;
mod config;
mod effects;
mod eq;
mod export;
mod filter;
mod gains;
mod mixer;
mod modulation;
mod output;
mod pitch;
mod player;
mod sequencer;
mod tables;
mod voice;

#[cfg(test)]
mod tests;

pub use backend::{LiveError, LivePlayer};
pub use config::{BitDepth, Interpolation, MixerConfig, MixerFlags};
pub use export::{export, AudioSink, MidiEvent, WavSink};
pub use player::{PlaybackStatus, Player, SharedPlayer};
pub use voice::{LoopKind, Voice};

// =============================================================================
// Engine limits
// =============================================================================

/// Total mixing voices: one per pattern channel plus background NNA voices.
pub const MAX_VOICES: usize = 256;

/// Mix buffer capacity in frames; one render chunk never exceeds this.
pub const MIXBUFFER_SIZE: usize = 512;

/// Headroom shift applied to channel gains before mixing.
pub(crate) const MIXING_ATTENUATION: u32 = 5;

/// Mix accumulator clip range (27 bits, leaving the attenuation headroom).
pub(crate) const MIXING_CLIPMIN: i32 = -0x0400_0000;
pub(crate) const MIXING_CLIPMAX: i32 = 0x03FF_FFFF;

/// Fractional bits carried by the per-sample volume ramp accumulators.
pub(crate) const VOLUME_RAMP_PRECISION: u32 = 12;

/// Fractional bits of the voice filter coefficients.
pub(crate) const FILTER_PRECISION: u32 = 24;

/// Volume ramp length in 1/10 ms (1.46 ms = 64 samples at 44.1 kHz).
pub(crate) const VOLUME_RAMP_LENGTH: u32 = 146;

/// 32-bit `a * b / c` computed through 64 bits, truncating.
#[inline]
pub(crate) fn muldiv(a: i32, b: i32, c: i32) -> i32 {
    ((a as i64 * b as i64) / c as i64) as i32
}

/// 32-bit `a * b / c` computed through 64 bits, rounding to nearest.
#[inline]
pub(crate) fn muldivr(a: i32, b: i32, c: i32) -> i32 {
    ((a as i64 * b as i64 + (c as i64 / 2)) / c as i64) as i32
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn muldiv_rounding() {
        assert_eq!(muldiv(100, 65536, 65536), 100);
        assert_eq!(muldiv(3, 65537, 65536), 3);
        assert_eq!(muldivr(3, 65537, 65536), 3);
        // muldivr rounds up at the halfway point, muldiv truncates.
        assert_eq!(muldiv(1, 3, 2), 1);
        assert_eq!(muldivr(1, 3, 2), 2);
    }

    #[test]
    fn muldiv_survives_14bit_volume_products() {
        // The worst case in the volume path: 14-bit volume times 7-bit global
        // volume times two 6-bit volumes, divided back down.
        let v = muldiv(16384 * 128, 64 * 64, 1 << 19);
        assert_eq!(v, 16384);
    }
}
