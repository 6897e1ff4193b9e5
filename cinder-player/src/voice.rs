//! Per-voice playback state.
//!
//! One [`Voice`] is one physical mixing slot. The first
//! [`cinder_song::MAX_CHANNELS`] voices are bound to pattern channels; the
//! rest are background voices that New Note Actions clone channel state into.
//! Everything here is transient: it is rebuilt from the song data as playback
//! progresses, and holds indices into the song's collections rather than
//! references, so instruments and samples can be replaced while playing.

use cinder_song::{Command, NewNoteAction, Sample, VolumeCommand, Waveform};

/// Loop topology of the active sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopKind {
    #[default]
    None,
    Forward,
    PingPong,
}

impl LoopKind {
    pub fn is_loop(&self) -> bool {
        !matches!(self, LoopKind::None)
    }
}

/// Effect that keeps running on every tick of the row (set from the effect
/// column, checked by the modulation pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ContinuedFx {
    #[default]
    None,
    Tremor,
    Arpeggio,
}

/// One mixing voice.
#[derive(Debug, Clone)]
pub struct Voice {
    // === Sample window ===
    /// Sample slot being played, `None` when silent.
    pub(crate) sample: Option<u8>,
    /// Instrument slot driving envelopes/NNA, `None` in sample mode.
    pub(crate) instrument: Option<u8>,
    /// Play position in frames.
    pub(crate) position: i32,
    /// 16-bit fractional position.
    pub(crate) position_frac: u32,
    /// Signed 16.16 resample increment; negative while ping-ponging back.
    pub(crate) increment: i32,
    /// Playable length in frames (may be shortened to the loop end).
    pub(crate) length: u32,
    pub(crate) loop_start: u32,
    pub(crate) loop_end: u32,
    pub(crate) loop_kind: LoopKind,
    /// Loop kind of the sample's sustain region (`None` if it has none).
    pub(crate) sustain_kind: LoopKind,
    /// Sustain loop currently engaged (disengages on key-off).
    pub(crate) sustain_engaged: bool,
    /// Ping-pong direction: currently playing backward.
    pub(crate) reverse: bool,

    // === Pitch ===
    /// Note as written in the pattern (for pitch-pan and duplicate checks).
    pub(crate) note: u8,
    /// Note that the next retrigger will play.
    pub(crate) new_note: u8,
    /// Instrument queued by a bare instrument number.
    pub(crate) new_instrument: u8,
    pub(crate) period: i32,
    /// Tone portamento destination period, 0 when inactive.
    pub(crate) portamento_target: i32,
    pub(crate) c5_speed: u32,
    /// Final frequency of the last tick, for telemetry.
    pub(crate) sample_freq: u32,

    // === Volume and panning ===
    /// Note volume, 0-256.
    pub(crate) volume: i32,
    /// Channel volume (Mxx), 0-64.
    pub(crate) channel_volume: i32,
    /// Sample x instrument global volume, 0-64.
    pub(crate) instrument_volume: i32,
    /// 14-bit output of the modulation pipeline.
    pub(crate) final_volume: i32,
    /// 16-bit fade accumulator, 65536 = no fade.
    pub(crate) fadeout_volume: i32,
    pub(crate) vol_swing: i32,
    pub(crate) pan_swing: i32,
    /// Channel panning, 0-256.
    pub(crate) panning: i32,
    /// Envelope/panbrello-adjusted panning of the last tick.
    pub(crate) final_panning: i32,
    /// Panning to restore when the next note plays, saved when an
    /// instrument default overrode it (pan + 1; surround remembered too).
    pub(crate) saved_pan: Option<(u16, bool)>,
    pub(crate) surround: bool,
    pub(crate) muted: bool,
    /// Muted only because the master channel was muted when the voice went
    /// to the background; cleared when the slot is reused.
    pub(crate) nna_muted: bool,

    // === Envelope cursors ===
    pub(crate) vol_env_position: i32,
    pub(crate) pan_env_position: i32,
    pub(crate) pitch_env_position: i32,
    /// Per-voice envelope enables (S7x can toggle them mid-note).
    pub(crate) vol_env_on: bool,
    pub(crate) pan_env_on: bool,
    pub(crate) pitch_env_on: bool,

    // === Modulation phase counters ===
    pub(crate) vibrato_position: u32,
    pub(crate) vibrato_speed: u32,
    pub(crate) vibrato_depth: u32,
    pub(crate) vibrato_type: Waveform,
    pub(crate) tremolo_position: u32,
    pub(crate) tremolo_speed: u32,
    pub(crate) tremolo_depth: i32,
    pub(crate) tremolo_type: Waveform,
    pub(crate) tremolo_delta: i32,
    pub(crate) panbrello_position: u32,
    pub(crate) panbrello_speed: u32,
    pub(crate) panbrello_depth: i32,
    pub(crate) panbrello_type: Waveform,
    pub(crate) panbrello_delta: i32,
    pub(crate) autovib_position: u32,
    /// Auto-vibrato sweep accumulator, depth << 8 at full sweep.
    pub(crate) autovib_depth: i32,

    // === Row state ===
    pub(crate) row_note: u8,
    pub(crate) row_instr: u8,
    pub(crate) row_volcmd: VolumeCommand,
    pub(crate) row_command: Command,
    pub(crate) last_instrument: u8,
    /// Command still in effect for the rest of the row.
    pub(crate) active_fx: ContinuedFx,
    /// Vibrato/tremolo/portamento armed for this row.
    pub(crate) vibrato_on: bool,
    pub(crate) tremolo_on: bool,
    pub(crate) portamento_on: bool,
    pub(crate) glissando: bool,

    // === Effect memory ===
    pub(crate) mem_pitchslide: u8,
    pub(crate) mem_portanote: u8,
    pub(crate) mem_volslide: u8,
    pub(crate) mem_channel_volslide: u8,
    pub(crate) mem_global_volslide: u8,
    pub(crate) mem_panslide: u8,
    pub(crate) mem_offset: u32,
    pub(crate) mem_arpeggio: u8,
    pub(crate) mem_retrig: u8,
    pub(crate) mem_tremor: u8,
    pub(crate) mem_special: u8,
    pub(crate) mem_tempo: u8,
    pub(crate) mem_vc_volslide: u8,

    // === Multi-tick countdowns ===
    pub(crate) cd_note_cut: u8,
    pub(crate) cd_note_delay: u8,
    pub(crate) cd_retrig: i32,
    /// Tremor phase: bit 7 = running, bit 6 = "on" half, low bits count
    /// down the current half.
    pub(crate) cd_tremor: u8,
    pub(crate) cd_pattern_loop: u8,
    pub(crate) pattern_loop_row: u32,

    // === Note lifecycle ===
    pub(crate) nna: NewNoteAction,
    /// Owning pattern channel + 1 for background voices, 0 otherwise.
    pub(crate) master_channel: u32,
    pub(crate) key_off: bool,
    pub(crate) note_fade: bool,
    /// Force the short ramp this tick (note triggers, cuts, volume jumps).
    pub(crate) fast_ramp: bool,
    /// A note was freshly triggered this row (filter reset logic).
    pub(crate) fresh_note: bool,

    // === Mixer gains and ramp ===
    pub(crate) left_volume: i32,
    pub(crate) right_volume: i32,
    pub(crate) left_volume_new: i32,
    pub(crate) right_volume_new: i32,
    /// Per-sample ramp step, in ramp precision.
    pub(crate) left_ramp: i32,
    pub(crate) right_ramp: i32,
    /// Ramp accumulators (gain << ramp precision).
    pub(crate) left_ramp_volume: i32,
    pub(crate) right_ramp_volume: i32,
    pub(crate) ramp_length: i32,
    pub(crate) ramp_enabled: bool,
    /// Click-suppression DC offsets left behind when the voice stops.
    pub(crate) lofs: i32,
    pub(crate) rofs: i32,
    pub(crate) vu_meter: u32,

    // === Filter ===
    pub(crate) filter_on: bool,
    pub(crate) cutoff: u8,
    pub(crate) resonance: u8,
    pub(crate) filter_a0: i32,
    pub(crate) filter_b0: i32,
    pub(crate) filter_b1: i32,
    /// Two delay taps per output channel.
    pub(crate) filter_y: [[i32; 2]; 2],
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            sample: None,
            instrument: None,
            position: 0,
            position_frac: 0,
            increment: 0,
            length: 0,
            loop_start: 0,
            loop_end: 0,
            loop_kind: LoopKind::None,
            sustain_kind: LoopKind::None,
            sustain_engaged: false,
            reverse: false,
            note: 0,
            new_note: 0,
            new_instrument: 0,
            period: 0,
            portamento_target: 0,
            c5_speed: 0,
            sample_freq: 0,
            volume: 256,
            channel_volume: 64,
            instrument_volume: 64,
            final_volume: 0,
            fadeout_volume: 65536,
            vol_swing: 0,
            pan_swing: 0,
            panning: 128,
            final_panning: 128,
            saved_pan: None,
            surround: false,
            muted: false,
            nna_muted: false,
            vol_env_position: 0,
            pan_env_position: 0,
            pitch_env_position: 0,
            vol_env_on: false,
            pan_env_on: false,
            pitch_env_on: false,
            vibrato_position: 0,
            vibrato_speed: 0,
            vibrato_depth: 0,
            vibrato_type: Waveform::Sine,
            tremolo_position: 0,
            tremolo_speed: 0,
            tremolo_depth: 0,
            tremolo_type: Waveform::Sine,
            tremolo_delta: 0,
            panbrello_position: 0,
            panbrello_speed: 0,
            panbrello_depth: 0,
            panbrello_type: Waveform::Sine,
            panbrello_delta: 0,
            autovib_position: 0,
            autovib_depth: 0,
            row_note: 0,
            row_instr: 0,
            row_volcmd: VolumeCommand::None,
            row_command: Command::None,
            last_instrument: 0,
            active_fx: ContinuedFx::None,
            vibrato_on: false,
            tremolo_on: false,
            portamento_on: false,
            glissando: false,
            mem_pitchslide: 0,
            mem_portanote: 0,
            mem_volslide: 0,
            mem_channel_volslide: 0,
            mem_global_volslide: 0,
            mem_panslide: 0,
            mem_offset: 0,
            mem_arpeggio: 0,
            mem_retrig: 0,
            mem_tremor: 0,
            mem_special: 0,
            mem_tempo: 0,
            mem_vc_volslide: 0,
            cd_note_cut: 0,
            cd_note_delay: 0,
            cd_retrig: 0,
            cd_tremor: 0,
            cd_pattern_loop: 0,
            pattern_loop_row: 0,
            nna: NewNoteAction::Cut,
            master_channel: 0,
            key_off: false,
            note_fade: false,
            fast_ramp: false,
            fresh_note: false,
            left_volume: 0,
            right_volume: 0,
            left_volume_new: 0,
            right_volume_new: 0,
            left_ramp: 0,
            right_ramp: 0,
            left_ramp_volume: 0,
            right_ramp_volume: 0,
            ramp_length: 0,
            ramp_enabled: false,
            lofs: 0,
            rofs: 0,
            vu_meter: 0,
            filter_on: false,
            cutoff: 0x7F,
            resonance: 0,
            filter_a0: 0,
            filter_b0: 0,
            filter_b1: 0,
            filter_y: [[0; 2]; 2],
        }
    }
}

impl Voice {
    /// Is this voice producing (or about to produce) sound?
    pub fn is_active(&self) -> bool {
        self.length != 0
    }

    /// Adopt a sample's loop topology as the voice's playback window flags.
    pub(crate) fn adopt_sample_loops(&mut self, smp: &Sample) {
        self.loop_kind = if smp.has_loop() {
            if smp.is_pingpong_loop() {
                LoopKind::PingPong
            } else {
                LoopKind::Forward
            }
        } else {
            LoopKind::None
        };
        self.sustain_kind = if smp.has_sustain_loop() {
            if smp.is_pingpong_sustain() {
                LoopKind::PingPong
            } else {
                LoopKind::Forward
            }
        } else {
            LoopKind::None
        };
        self.sustain_engaged = self.sustain_kind.is_loop();
        self.reverse = false;
    }

    /// Stop producing sound immediately, leaving row/memory state alone.
    pub(crate) fn stop(&mut self) {
        self.length = 0;
        self.position = 0;
        self.position_frac = 0;
        self.sample = None;
        self.rofs = 0;
        self.lofs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_song::{SampleData, SampleFlags};

    #[test]
    fn adopt_sample_loops() {
        let mut smp = Sample::new(SampleData::Mono8(vec![0; 64]), 8363);
        smp.flags = SampleFlags::LOOP | SampleFlags::SUSTAIN_LOOP | SampleFlags::PINGPONG_SUSTAIN;

        let mut v = Voice::default();
        v.adopt_sample_loops(&smp);
        assert_eq!(v.loop_kind, LoopKind::Forward);
        assert_eq!(v.sustain_kind, LoopKind::PingPong);
        assert!(v.sustain_engaged);

        smp.flags = SampleFlags::LOOP | SampleFlags::PINGPONG_LOOP;
        v.adopt_sample_loops(&smp);
        assert_eq!(v.loop_kind, LoopKind::PingPong);
        assert_eq!(v.sustain_kind, LoopKind::None);
        assert!(!v.sustain_engaged);
    }

    #[test]
    fn stop_clears_playback_but_not_memory() {
        let mut v = Voice {
            length: 100,
            position: 50,
            mem_volslide: 0x42,
            ..Default::default()
        };
        v.stop();
        assert!(!v.is_active());
        assert_eq!(v.mem_volslide, 0x42, "effect memory survives a stop");
    }
}
