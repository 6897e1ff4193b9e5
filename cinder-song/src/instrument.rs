//! Instruments: envelopes, note actions, and the note/sample keyboard map

use crate::{Envelope, MAX_SAMPLES, NOTE_LAST};

/// What an already-playing voice does when its channel triggers a new note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NewNoteAction {
    /// Stop the old voice immediately.
    #[default]
    Cut = 0,
    /// Keep the old voice playing untouched in the background.
    Continue = 1,
    /// Release the old voice (key off).
    NoteOff = 2,
    /// Fade the old voice out at the instrument's fadeout rate.
    NoteFade = 3,
}

impl NewNoteAction {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Continue,
            2 => Self::NoteOff,
            3 => Self::NoteFade,
            _ => Self::Cut,
        }
    }
}

/// Which property identifies a "duplicate" note for duplicate checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DuplicateCheckType {
    #[default]
    Off = 0,
    Note = 1,
    Sample = 2,
    Instrument = 3,
}

impl DuplicateCheckType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Note,
            2 => Self::Sample,
            3 => Self::Instrument,
            _ => Self::Off,
        }
    }
}

/// What happens to the duplicate voice when the check matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DuplicateCheckAction {
    #[default]
    Cut = 0,
    NoteOff = 1,
    NoteFade = 2,
}

impl DuplicateCheckAction {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::NoteOff,
            2 => Self::NoteFade,
            _ => Self::Cut,
        }
    }
}

/// One keyboard entry: the note actually played and the sample slot used
/// when this instrument is triggered at a given pattern note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyboardEntry {
    /// Transposed note (1-120), 0 to keep the pattern note.
    pub note: u8,
    /// Sample slot (1-based), 0 for no sample.
    pub sample: u8,
}

/// An instrument: the playback personality wrapped around samples.
#[derive(Debug, Clone)]
pub struct Instrument {
    /// Instrument name (max 26 chars by convention).
    pub name: String,
    pub volume_envelope: Envelope,
    pub panning_envelope: Envelope,
    /// Pitch envelope; with [`EnvelopeFlags::FILTER`] set it drives the
    /// voice filter cutoff instead.
    pub pitch_envelope: Envelope,
    pub nna: NewNoteAction,
    pub dct: DuplicateCheckType,
    pub dca: DuplicateCheckAction,
    /// Fadeout rate, subtracted (x2) from the 16-bit fade volume per tick.
    pub fadeout: u16,
    /// Global volume (0-128).
    pub global_volume: u8,
    /// Default panning (0-256), `None` when the instrument does not set one.
    pub default_pan: Option<u8>,
    /// Pitch-pan separation (-32..=32): pans notes by distance from center.
    pub pitch_pan_separation: i8,
    /// Pitch-pan center note (1-120).
    pub pitch_pan_center: u8,
    /// Random volume variation per note, in percent (0-100).
    pub volume_swing: u8,
    /// Random panning variation per note (0-64).
    pub pan_swing: u8,
    /// Initial filter cutoff (0-127), `None` leaves the voice's value alone.
    pub filter_cutoff: Option<u8>,
    /// Initial filter resonance (0-127).
    pub filter_resonance: Option<u8>,
    /// Keyboard table indexed by pattern note - 1.
    pub keyboard: [KeyboardEntry; NOTE_LAST as usize],
    /// MIDI output channel bitmask; 0 disables MIDI for this instrument.
    pub midi_channel_mask: u32,
    /// MIDI program (0-127), `None` when unset.
    pub midi_program: Option<u8>,
    /// MIDI bank (0-16383), `None` when unset.
    pub midi_bank: Option<u16>,
}

impl Default for Instrument {
    fn default() -> Self {
        // Identity keyboard: note n plays note n on sample 0 (none).
        let mut keyboard = [KeyboardEntry::default(); NOTE_LAST as usize];
        for (i, entry) in keyboard.iter_mut().enumerate() {
            entry.note = i as u8 + 1;
        }

        Self {
            name: String::new(),
            volume_envelope: Envelope::default(),
            panning_envelope: Envelope {
                nodes: vec![
                    crate::EnvelopeNode::new(0, 32),
                    crate::EnvelopeNode::new(100, 32),
                ],
                ..Envelope::default()
            },
            pitch_envelope: Envelope {
                nodes: vec![
                    crate::EnvelopeNode::new(0, 32),
                    crate::EnvelopeNode::new(100, 32),
                ],
                ..Envelope::default()
            },
            nna: NewNoteAction::default(),
            dct: DuplicateCheckType::default(),
            dca: DuplicateCheckAction::default(),
            fadeout: 0,
            global_volume: 128,
            default_pan: None,
            pitch_pan_separation: 0,
            pitch_pan_center: 60,
            volume_swing: 0,
            pan_swing: 0,
            filter_cutoff: None,
            filter_resonance: None,
            keyboard,
            midi_channel_mask: 0,
            midi_program: None,
            midi_bank: None,
        }
    }
}

impl Instrument {
    /// Keyboard entry for a playable note (1-120).
    #[inline]
    pub fn map_note(&self, note: u8) -> KeyboardEntry {
        debug_assert!(note >= 1 && note <= NOTE_LAST);
        self.keyboard[(note - 1) as usize]
    }

    pub fn has_volume_envelope(&self) -> bool {
        self.volume_envelope.is_enabled()
    }

    pub fn has_panning_envelope(&self) -> bool {
        self.panning_envelope.is_enabled()
    }

    pub fn has_pitch_envelope(&self) -> bool {
        self.pitch_envelope.is_enabled()
    }

    /// The pitch envelope doubles as a filter envelope when flagged.
    pub fn has_filter_envelope(&self) -> bool {
        self.pitch_envelope.is_enabled() && self.pitch_envelope.is_filter()
    }

    /// Clamp all fields into the ranges the player assumes.
    pub fn sanitize(&mut self) {
        self.volume_envelope.sanitize();
        self.panning_envelope.sanitize();
        self.pitch_envelope.sanitize();
        self.global_volume = self.global_volume.min(128);
        self.volume_swing = self.volume_swing.min(100);
        self.pan_swing = self.pan_swing.min(64);
        self.pitch_pan_center = self.pitch_pan_center.clamp(1, NOTE_LAST);
        if let Some(c) = self.filter_cutoff.as_mut() {
            *c = (*c).min(127);
        }
        if let Some(r) = self.filter_resonance.as_mut() {
            *r = (*r).min(127);
        }
        for entry in &mut self.keyboard {
            if entry.note > NOTE_LAST {
                entry.note = NOTE_LAST;
            }
            if entry.sample as usize >= MAX_SAMPLES {
                entry.sample = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnvelopeFlags;

    #[test]
    fn default_keyboard_is_identity() {
        let ins = Instrument::default();
        assert_eq!(ins.map_note(1).note, 1);
        assert_eq!(ins.map_note(60).note, 60);
        assert_eq!(ins.map_note(60).sample, 0);
    }

    #[test]
    fn sanitize_clamps() {
        let mut ins = Instrument {
            global_volume: 200,
            volume_swing: 150,
            pan_swing: 80,
            pitch_pan_center: 0,
            filter_cutoff: Some(200),
            ..Default::default()
        };
        ins.keyboard[0] = KeyboardEntry { note: 250, sample: 200 };
        ins.sanitize();

        assert_eq!(ins.global_volume, 128);
        assert_eq!(ins.volume_swing, 100);
        assert_eq!(ins.pan_swing, 64);
        assert_eq!(ins.pitch_pan_center, 1);
        assert_eq!(ins.filter_cutoff, Some(127));
        assert_eq!(ins.keyboard[0].note, NOTE_LAST);
        assert_eq!(ins.keyboard[0].sample, 0);
    }

    #[test]
    fn filter_envelope_flag() {
        let mut ins = Instrument::default();
        ins.pitch_envelope.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::FILTER;
        assert!(ins.has_filter_envelope());
        assert!(ins.has_pitch_envelope());
    }
}
