//! Model validation errors

use thiserror::Error;

/// Errors reported when handing a song to the player.
///
/// Most malformed data is clamped into range by the `sanitize` methods rather
/// than rejected; these variants cover the cases where clamping would silently
/// play the wrong data (dangling references), which the loader must fix.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SongError {
    #[error("instrument {instrument} maps note {note} to missing sample {sample}")]
    BadSampleMap {
        instrument: usize,
        note: u8,
        sample: u8,
    },

    #[error("order list entry {order} references missing pattern {pattern}")]
    BadOrder { order: usize, pattern: u8 },

    #[error("sample {sample} window of {length} frames exceeds {available} decoded frames")]
    BadSampleWindow {
        sample: usize,
        length: u32,
        available: u32,
    },
}
