//! The song: patterns, order list, instruments, samples, channel defaults

use crate::{
    Instrument, Pattern, Sample, SongError, MAX_CHANNELS, MAX_INSTRUMENTS, MAX_ORDERS,
    MAX_PATTERNS, MAX_SAMPLES, ORDER_LAST,
};

/// Playback-mode flags fixed by the module format at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SongFlags(u16);

impl SongFlags {
    /// Notes trigger instruments (with envelopes and NNA) rather than
    /// bare samples.
    pub const INSTRUMENT_MODE: Self = Self(0x0001);
    /// Pitch slides are exponential (linear in semitones) rather than
    /// additive on Amiga periods.
    pub const LINEAR_SLIDES: Self = Self(0x0002);
    /// Legacy "old effects" semantics: vibrato is inverted and shallower,
    /// tremolo and vibrato skip the first tick, offsets past the end clamp.
    pub const OLD_EFFECTS: Self = Self(0x0004);
    /// Gxx keeps its own slide memory, separate from Exx/Fxx.
    pub const COMPAT_GXX: Self = Self(0x0008);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for SongFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-channel defaults applied when playback starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Channel volume (0-64).
    pub volume: u8,
    /// Channel panning (0-256).
    pub panning: u16,
    pub muted: bool,
    pub surround: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            volume: 64,
            panning: 128,
            muted: false,
            surround: false,
        }
    }
}

/// A complete song as handed over by a format loader.
///
/// Instruments and samples live in 1-based slots (slot 0 exists but is never
/// referenced); patterns may be absent, in which case the player synthesizes
/// a blank one on demand.
#[derive(Debug, Clone)]
pub struct Song {
    pub name: String,
    pub flags: SongFlags,
    /// Order list; entries are pattern numbers, [`crate::ORDER_SKIP`] or
    /// [`ORDER_LAST`].
    pub orders: Vec<u8>,
    pub patterns: Vec<Option<Pattern>>,
    pub instruments: Vec<Option<Instrument>>,
    pub samples: Vec<Sample>,
    pub channels: [ChannelSettings; MAX_CHANNELS],
    /// Ticks per row at song start.
    pub initial_speed: u32,
    /// Tempo in BPM at song start (32-255).
    pub initial_tempo: u32,
    /// Initial global volume (0-128).
    pub initial_global_volume: u32,
    /// Pre-mix master volume (0-128).
    pub mixing_volume: u32,
    /// Stereo separation (0-128, 128 = full).
    pub pan_separation: u8,
}

impl Default for Song {
    fn default() -> Self {
        Self {
            name: String::new(),
            flags: SongFlags::empty(),
            orders: vec![ORDER_LAST; MAX_ORDERS],
            patterns: Vec::new(),
            instruments: Vec::new(),
            samples: Vec::new(),
            channels: [ChannelSettings::default(); MAX_CHANNELS],
            initial_speed: 6,
            initial_tempo: 125,
            initial_global_volume: 128,
            mixing_volume: 48,
            pan_separation: 128,
        }
    }
}

impl Song {
    pub fn instrument_mode(&self) -> bool {
        self.flags.contains(SongFlags::INSTRUMENT_MODE)
    }

    pub fn linear_slides(&self) -> bool {
        self.flags.contains(SongFlags::LINEAR_SLIDES)
    }

    pub fn old_effects(&self) -> bool {
        self.flags.contains(SongFlags::OLD_EFFECTS)
    }

    pub fn compat_gxx(&self) -> bool {
        self.flags.contains(SongFlags::COMPAT_GXX)
    }

    /// Instrument in a 1-based slot, if present.
    #[inline]
    pub fn instrument(&self, slot: u8) -> Option<&Instrument> {
        if slot == 0 {
            return None;
        }
        self.instruments.get(slot as usize)?.as_ref()
    }

    /// Sample in a 1-based slot, if present.
    #[inline]
    pub fn sample(&self, slot: u8) -> Option<&Sample> {
        if slot == 0 {
            return None;
        }
        self.samples.get(slot as usize)
    }

    /// Pattern by number, if allocated.
    #[inline]
    pub fn pattern(&self, number: u8) -> Option<&Pattern> {
        self.patterns.get(number as usize)?.as_ref()
    }

    /// Clamp every component into the ranges the player assumes. Loaders
    /// call this once after populating the song.
    pub fn sanitize(&mut self) {
        self.orders.truncate(MAX_ORDERS);
        if self.orders.is_empty() {
            self.orders.push(ORDER_LAST);
        }
        self.patterns.truncate(MAX_PATTERNS);
        self.instruments.truncate(MAX_INSTRUMENTS);
        self.samples.truncate(MAX_SAMPLES);

        for ins in self.instruments.iter_mut().flatten() {
            ins.sanitize();
        }
        for smp in &mut self.samples {
            smp.sanitize();
        }
        for chan in &mut self.channels {
            chan.volume = chan.volume.min(64);
            chan.panning = chan.panning.min(256);
        }

        if self.initial_speed == 0 {
            self.initial_speed = 6;
        }
        self.initial_tempo = self.initial_tempo.clamp(32, 255);
        self.initial_global_volume = self.initial_global_volume.min(128);
        self.mixing_volume = self.mixing_volume.min(128);
        self.pan_separation = self.pan_separation.min(128);
    }

    /// Check the cross-references clamping cannot fix: keyboard entries and
    /// sample windows must point at real data before playback starts.
    pub fn validate(&self) -> Result<(), SongError> {
        for (slot, ins) in self.instruments.iter().enumerate() {
            let Some(ins) = ins else { continue };
            for (i, entry) in ins.keyboard.iter().enumerate() {
                if entry.sample != 0 && self.sample(entry.sample).is_none() {
                    return Err(SongError::BadSampleMap {
                        instrument: slot,
                        note: i as u8 + 1,
                        sample: entry.sample,
                    });
                }
            }
        }
        for (slot, smp) in self.samples.iter().enumerate() {
            if smp.length > smp.data.frames() {
                return Err(SongError::BadSampleWindow {
                    sample: slot,
                    length: smp.length,
                    available: smp.data.frames(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyboardEntry, SampleData};

    #[test]
    fn slot_lookup_is_one_based() {
        let mut song = Song::default();
        song.samples = vec![Sample::default(); 3];
        song.instruments = vec![None, Some(Instrument::default())];

        assert!(song.sample(0).is_none(), "slot 0 is never a sample");
        assert!(song.sample(1).is_some());
        assert!(song.instrument(0).is_none());
        assert!(song.instrument(1).is_some());
        assert!(song.instrument(2).is_none());
    }

    #[test]
    fn sanitize_fixes_ranges() {
        let mut song = Song {
            initial_speed: 0,
            initial_tempo: 999,
            initial_global_volume: 200,
            mixing_volume: 300,
            pan_separation: 255,
            orders: Vec::new(),
            ..Default::default()
        };
        song.channels[0].panning = 999;
        song.sanitize();

        assert_eq!(song.initial_speed, 6);
        assert_eq!(song.initial_tempo, 255);
        assert_eq!(song.initial_global_volume, 128);
        assert_eq!(song.mixing_volume, 128);
        assert_eq!(song.pan_separation, 128);
        assert_eq!(song.channels[0].panning, 256);
        assert_eq!(song.orders, vec![ORDER_LAST]);
    }

    #[test]
    fn validate_rejects_dangling_sample_map() {
        let mut song = Song::default();
        song.samples = vec![Sample::new(SampleData::Mono8(vec![0; 16]), 8363); 2];
        let mut ins = Instrument::default();
        ins.keyboard[59] = KeyboardEntry { note: 60, sample: 7 };
        song.instruments = vec![None, Some(ins)];

        let err = song.validate().unwrap_err();
        assert_eq!(
            err,
            SongError::BadSampleMap {
                instrument: 1,
                note: 60,
                sample: 7
            }
        );
    }
}
