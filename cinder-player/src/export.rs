//! Offline export: drain the renderer into a push-style sink.
//!
//! The export path calls the exact same [`Player::render`] the live backend
//! does, so a WAV written here is bit-identical to what the sound card was
//! fed. Sinks receive raw PCM chunks plus any MIDI events the song emitted,
//! timestamped in frames from the start position.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::debug;

use crate::{BitDepth, Player};

/// A timestamped MIDI message emitted during playback (note events from
/// instruments with MIDI routing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Frame offset from the start of rendering.
    pub frame: u64,
    /// Raw message bytes, `len` of them used.
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiEvent {
    pub(crate) fn note_on(frame: u64, channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            frame,
            data: [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            len: 3,
        }
    }

    pub(crate) fn note_off(frame: u64, channel: u8, note: u8) -> Self {
        Self {
            frame,
            data: [0x80 | (channel & 0x0F), note & 0x7F, 0x40],
            len: 3,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Push-style receiver for rendered audio, used identically for disk
/// writers and live drivers.
pub trait AudioSink {
    /// One chunk of PCM in the player's configured output format.
    fn write_pcm(&mut self, data: &[u8], frames: usize) -> io::Result<()>;

    /// A MIDI event that fired inside the most recent chunk.
    fn midi_event(&mut self, _event: &MidiEvent) -> io::Result<()> {
        Ok(())
    }

    /// Flush and finalize the sink.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// WAV-file sink. Interprets the player's little-endian output according
/// to its configured bit depth (the byte-swap flag must be off).
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    depth: BitDepth,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, config: &crate::MixerConfig) -> io::Result<Self> {
        let spec = WavSpec {
            channels: config.channels as u16,
            sample_rate: config.sample_rate,
            bits_per_sample: config.bit_depth.bits(),
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec).map_err(io_from_hound)?;
        Ok(Self {
            writer: Some(writer),
            depth: config.bit_depth,
        })
    }
}

fn io_from_hound(err: hound::Error) -> io::Error {
    match err {
        hound::Error::IoError(e) => e,
        other => io::Error::other(other),
    }
}

impl AudioSink for WavSink {
    fn write_pcm(&mut self, data: &[u8], _frames: usize) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        match self.depth {
            BitDepth::Bits8 => {
                for &b in data {
                    // Output is unsigned 8-bit; hound wants it signed.
                    writer
                        .write_sample((b as i16 - 128) as i8)
                        .map_err(io_from_hound)?;
                }
            }
            BitDepth::Bits16 => {
                for pair in data.chunks_exact(2) {
                    writer
                        .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                        .map_err(io_from_hound)?;
                }
            }
            BitDepth::Bits24 => {
                for triple in data.chunks_exact(3) {
                    let v = i32::from_le_bytes([0, triple[0], triple[1], triple[2]]) >> 8;
                    writer.write_sample(v).map_err(io_from_hound)?;
                }
            }
            BitDepth::Bits32 => {
                for quad in data.chunks_exact(4) {
                    writer
                        .write_sample(i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                        .map_err(io_from_hound)?;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(io_from_hound)?;
        }
        Ok(())
    }
}

/// Frames rendered per export chunk.
const EXPORT_CHUNK: usize = 1024;

/// Drain `player` into `sink` until the song ends or `frame_limit` frames
/// have been written. Returns the number of frames exported.
pub fn export<S: AudioSink>(
    player: &mut Player,
    sink: &mut S,
    frame_limit: Option<u64>,
) -> io::Result<u64> {
    let frame_bytes = player.config().frame_bytes();
    let mut buffer = vec![0u8; EXPORT_CHUNK * frame_bytes];
    let mut midi = Vec::new();
    let mut total = 0u64;

    loop {
        let want = match frame_limit {
            Some(limit) => (limit - total).min(EXPORT_CHUNK as u64) as usize,
            None => EXPORT_CHUNK,
        };
        if want == 0 {
            break;
        }

        let frames = player.render(&mut buffer[..want * frame_bytes]);

        player.take_midi(&mut midi);
        for event in midi.drain(..) {
            sink.midi_event(&event)?;
        }

        if frames > 0 {
            sink.write_pcm(&buffer[..frames * frame_bytes], frames)?;
            total += frames as u64;
        }
        if frames < want {
            break; // end of song
        }
    }

    sink.finish()?;
    debug!(frames = total, "export finished");
    Ok(total)
}

/// Sink that just accumulates everything, for tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) struct CaptureSink {
        pub pcm: Vec<u8>,
        pub frames: usize,
        pub midi: Vec<MidiEvent>,
        pub finished: bool,
    }

    impl CaptureSink {
        pub(crate) fn new() -> Self {
            Self {
                pcm: Vec::new(),
                frames: 0,
                midi: Vec::new(),
                finished: false,
            }
        }
    }

    impl AudioSink for CaptureSink {
        fn write_pcm(&mut self, data: &[u8], frames: usize) -> io::Result<()> {
            self.pcm.extend_from_slice(data);
            self.frames += frames;
            Ok(())
        }

        fn midi_event(&mut self, event: &MidiEvent) -> io::Result<()> {
            self.midi.push(*event);
            Ok(())
        }

        fn finish(&mut self) -> io::Result<()> {
            self.finished = true;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::CaptureSink;
    use super::*;

    #[test]
    fn midi_event_encoding() {
        let on = MidiEvent::note_on(100, 2, 60, 100);
        assert_eq!(on.bytes(), &[0x92, 60, 100]);
        let off = MidiEvent::note_off(200, 2, 60);
        assert_eq!(off.bytes(), &[0x82, 60, 0x40]);
    }

    #[test]
    fn export_respects_frame_limit() {
        let mut player = crate::tests::player_for(crate::tests::one_note_song());
        let mut sink = CaptureSink::new();
        let frames = export(&mut player, &mut sink, Some(1000)).unwrap();
        assert_eq!(frames, 1000);
        assert_eq!(sink.frames, 1000);
        assert_eq!(sink.pcm.len(), 1000 * player.config().frame_bytes());
        assert!(sink.finished);
    }
}
