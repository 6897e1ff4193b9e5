//! Mixer configuration

/// Output sample width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 8-bit unsigned.
    Bits8,
    /// 16-bit signed, the usual choice.
    #[default]
    Bits16,
    /// 24-bit signed, packed 3 bytes per sample.
    Bits24,
    /// 32-bit signed.
    Bits32,
}

impl BitDepth {
    pub fn bytes(&self) -> usize {
        match self {
            BitDepth::Bits8 => 1,
            BitDepth::Bits16 => 2,
            BitDepth::Bits24 => 3,
            BitDepth::Bits32 => 4,
        }
    }

    pub fn bits(&self) -> u16 {
        self.bytes() as u16 * 8
    }
}

/// Resampling quality used when a voice's increment is not exactly 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Nearest sample, no interpolation.
    Nearest,
    #[default]
    Linear,
}

/// Mixer behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MixerFlags(u16);

impl MixerFlags {
    /// Disable volume ramping (gains snap; audible clicks on transitions).
    pub const NO_RAMPING: Self = Self(0x0001);
    /// Ignore per-voice surround flags.
    pub const NO_SURROUND: Self = Self(0x0002);
    /// Swap left and right output.
    pub const REVERSE_STEREO: Self = Self(0x0004);
    /// Run the EQ stage over the mix buffer.
    pub const EQ: Self = Self(0x0008);
    /// Longer, buffer-length volume ramps when both endpoint gains are
    /// audible (the "high quality" ramp mode).
    pub const HQ_RAMPING: Self = Self(0x0010);
    /// Byte-swap output words (big-endian consumers).
    pub const BYTE_SWAP: Self = Self(0x0020);
    /// Mix every audible voice regardless of the voice limit, for offline
    /// rendering where CPU headroom does not matter.
    pub const DIRECT_TO_DISK: Self = Self(0x0040);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for MixerFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Everything the render path needs to know about the output side, passed
/// explicitly so no global state couples one render call to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerConfig {
    /// Output rate in Hz (clamped to 4000..=192000 on configure).
    pub sample_rate: u32,
    pub bit_depth: BitDepth,
    /// Output channels: 1, 2, or 4 (front pair duplicated to the rear).
    pub channels: u32,
    pub interpolation: Interpolation,
    pub flags: MixerFlags,
    /// Stereo separation (0-128): 0 collapses to mono, 128 is full width.
    pub stereo_separation: u32,
    /// Global frequency factor, 128 = 1.0. Applied to every voice increment.
    pub freq_factor: u32,
    /// Global tempo factor, 128 = 1.0. Applied to the tick length.
    pub tempo_factor: u32,
    /// Voices actually mixed per chunk; the quietest beyond this are skipped.
    pub max_voices: u32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            bit_depth: BitDepth::default(),
            channels: 2,
            interpolation: Interpolation::default(),
            flags: MixerFlags::empty(),
            stereo_separation: 128,
            freq_factor: 128,
            tempo_factor: 128,
            max_voices: 32,
        }
    }
}

impl MixerConfig {
    /// Bytes per output frame (all channels).
    pub fn frame_bytes(&self) -> usize {
        self.bit_depth.bytes() * self.channels as usize
    }

    /// Clamp into the ranges the engine supports.
    pub(crate) fn sanitize(&mut self) {
        self.sample_rate = self.sample_rate.clamp(4_000, 192_000);
        self.channels = match self.channels {
            0 | 1 => 1,
            2 | 3 => 2,
            _ => 4,
        };
        self.stereo_separation = self.stereo_separation.min(128);
        if self.freq_factor == 0 {
            self.freq_factor = 128;
        }
        if self.tempo_factor == 0 {
            self.tempo_factor = 128;
        }
        self.max_voices = self
            .max_voices
            .clamp(1, crate::MAX_VOICES as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_to_supported_ranges() {
        let mut cfg = MixerConfig {
            sample_rate: 1,
            channels: 7,
            stereo_separation: 500,
            freq_factor: 0,
            tempo_factor: 0,
            max_voices: 10_000,
            ..Default::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.sample_rate, 4_000);
        assert_eq!(cfg.channels, 4);
        assert_eq!(cfg.stereo_separation, 128);
        assert_eq!(cfg.freq_factor, 128);
        assert_eq!(cfg.tempo_factor, 128);
        assert_eq!(cfg.max_voices, crate::MAX_VOICES as u32);
    }

    #[test]
    fn frame_bytes() {
        let cfg = MixerConfig::default();
        assert_eq!(cfg.frame_bytes(), 4);
        let cfg = MixerConfig {
            bit_depth: BitDepth::Bits24,
            channels: 1,
            ..Default::default()
        };
        assert_eq!(cfg.frame_bytes(), 3);
    }
}
