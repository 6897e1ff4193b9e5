//! Cinder-Song: song, instrument, and sample data model for the Cinder
//! playback engine.
//!
//! This crate holds the static side of a pattern-based composition: patterns
//! of notes and commands, instruments with their envelopes and note actions,
//! and samples with decoded PCM data. Format loaders populate these
//! structures; the `cinder-player` engine consumes them read-only while
//! rendering.
//!
//! The model is defensive in the same way the engine is: out-of-range loop
//! points, envelope indices, and pan/volume values are clamped into range by
//! [`Song::sanitize`] rather than rejected, so a malformed module degrades
//! into something playable instead of failing to load.

mod envelope;
mod error;
mod instrument;
mod pattern;
mod sample;
mod song;

pub use envelope::{Envelope, EnvelopeFlags, EnvelopeNode};
pub use error::SongError;
pub use instrument::{
    DuplicateCheckAction, DuplicateCheckType, Instrument, KeyboardEntry, NewNoteAction,
};
pub use pattern::{Command, Note, Pattern, VolumeCommand};
pub use sample::{Sample, SampleData, SampleFlags, Waveform};
pub use song::{ChannelSettings, Song, SongFlags};

// =============================================================================
// Limits
// =============================================================================

/// Maximum number of pattern channels.
pub const MAX_CHANNELS: usize = 64;

/// Maximum number of patterns in a song.
pub const MAX_PATTERNS: usize = 240;

/// Maximum number of instruments (1-based slots).
pub const MAX_INSTRUMENTS: usize = 99;

/// Maximum number of samples (1-based slots).
pub const MAX_SAMPLES: usize = 99;

/// Maximum number of entries in the order list.
pub const MAX_ORDERS: usize = 256;

/// Maximum number of nodes in an envelope.
pub const MAX_ENVELOPE_NODES: usize = 25;

/// Rows in a freshly allocated blank pattern.
pub const DEFAULT_PATTERN_ROWS: u16 = 64;

// =============================================================================
// Note values
// =============================================================================

/// Empty note cell.
pub const NOTE_NONE: u8 = 0;

/// Lowest playable note (C-0).
pub const NOTE_FIRST: u8 = 1;

/// Highest playable note (B-9).
pub const NOTE_LAST: u8 = 120;

/// Note value for "note fade".
pub const NOTE_FADE: u8 = 253;

/// Note value for "note cut" (===).
pub const NOTE_CUT: u8 = 254;

/// Note value for "note off" (^^^).
pub const NOTE_OFF: u8 = 255;

/// Is this a playable note (as opposed to empty or a control value)?
#[inline]
pub fn note_is_note(note: u8) -> bool {
    (NOTE_FIRST..=NOTE_LAST).contains(&note)
}

/// Is this one of the control values (off/cut/fade)?
#[inline]
pub fn note_is_control(note: u8) -> bool {
    note > NOTE_LAST && note != NOTE_NONE
}

// =============================================================================
// Order list sentinels
// =============================================================================

/// Order entry for "skip to next" (+++).
pub const ORDER_SKIP: u8 = 254;

/// Order entry for "end of song" (---).
pub const ORDER_LAST: u8 = 255;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_classification() {
        assert!(!note_is_note(NOTE_NONE));
        assert!(note_is_note(NOTE_FIRST));
        assert!(note_is_note(60));
        assert!(note_is_note(NOTE_LAST));
        assert!(!note_is_note(NOTE_OFF));

        assert!(!note_is_control(NOTE_NONE));
        assert!(note_is_control(NOTE_OFF));
        assert!(note_is_control(NOTE_CUT));
        assert!(note_is_control(NOTE_FADE));
        assert!(!note_is_control(64));
    }
}
