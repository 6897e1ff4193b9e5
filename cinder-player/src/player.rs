//! The player: owns the song, the voice pool, and all playback state.
//!
//! [`Player::render`] is the single entry point that everything drains:
//! the live backend, the export path, and tests all pull PCM through it,
//! which is what makes live playback and offline export bit-identical.
//! The render path allocates nothing; every buffer it touches was sized
//! in [`Player::new`]/[`Player::configure`].

use std::sync::{Arc, Mutex, MutexGuard};

use cinder_song::{Song, MAX_CHANNELS};
use tracing::debug;

use crate::eq::Equalizer;
use crate::export::MidiEvent;
use crate::output::{convert_chunk, mono_from_stereo, silence, stereo_fill, VuTracker};
use crate::sequencer::PROCESS_NEXT_ORDER;
use crate::voice::Voice;
use crate::{
    muldiv, MixerConfig, MixerFlags, MAX_VOICES, MIXBUFFER_SIZE, VOLUME_RAMP_LENGTH,
};

/// Deterministic xorshift generator for every "random" the engine needs
/// (random modulation waveforms, volume/pan swing). Reseeded on transport
/// starts so the same song from the same position renders identically.
#[derive(Debug, Clone)]
pub(crate) struct Prng(u32);

impl Prng {
    const SEED: u32 = 0x5EED_1234;

    fn new() -> Self {
        Self(Self::SEED)
    }

    fn reseed(&mut self) {
        self.0 = Self::SEED;
    }

    #[inline]
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// A random modulation-waveform sample, -64..=63.
    #[inline]
    pub(crate) fn wave(&mut self) -> i32 {
        (self.next() & 0x7F) as i32 - 0x40
    }

    /// Uniform in -1.0..1.0, for the swing rolls.
    #[inline]
    pub(crate) fn bipolar(&mut self) -> f64 {
        self.next() as f64 / (u32::MAX as f64 / 2.0) - 1.0
    }
}

/// A point-in-time snapshot of playback state for UIs, polled under the
/// player lock once per refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub order: u32,
    pub pattern: u32,
    pub row: u32,
    /// Ticks elapsed in the current row.
    pub tick: u32,
    pub speed: u32,
    pub tempo: u32,
    pub global_volume: u32,
    /// Peak-to-peak output levels, 0-255 per side.
    pub vu_left: u32,
    pub vu_right: u32,
    /// Voices mixed in the last chunk.
    pub mixed_voices: u32,
    pub end_reached: bool,
}

/// The shared handle the live backend and UI threads hold.
pub type SharedPlayer = Arc<Mutex<Player>>;

/// Lock a shared player, recovering from a poisoned mutex (a panicked
/// holder leaves the state intact for our purposes).
pub(crate) fn lock_player(player: &SharedPlayer) -> MutexGuard<'_, Player> {
    player.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Player {
    pub(crate) song: Song,
    pub(crate) config: MixerConfig,
    pub(crate) voices: Vec<Voice>,
    /// Indices of voices to mix this tick, loudest-first when over limit.
    pub(crate) voice_mix: Vec<usize>,
    pub(crate) mix_buffer: Vec<i32>,

    // Sequencer state.
    pub(crate) current_order: u32,
    pub(crate) process_order: i32,
    pub(crate) current_pattern: u32,
    pub(crate) row: u32,
    pub(crate) process_row: u32,
    pub(crate) break_row: u32,
    pub(crate) tick_count: u32,
    pub(crate) row_count: i32,
    pub(crate) current_speed: u32,
    pub(crate) current_tempo: u32,
    pub(crate) current_global_volume: u32,
    /// Frames left in the current tick.
    pub(crate) buffer_count: u32,
    pub(crate) frame_delay: u32,
    /// Counts up toward zero; see [`Player::set_repeat_count`].
    pub(crate) repeat_count: i32,
    pub(crate) pattern_loop_active: bool,

    // Runtime flags.
    pub(crate) first_tick: bool,
    pub(crate) end_reached: bool,
    pub(crate) paused: bool,
    pub(crate) pattern_playback: bool,
    pub(crate) pattern_playback_started: bool,
    pub(crate) order_locked: bool,
    pub(crate) stop_at_order: i32,
    pub(crate) stop_at_row: i32,
    pub(crate) step_remaining: Option<u32>,

    // Global fade-out (stop_with_fade).
    pub(crate) fade_samples: u32,
    pub(crate) fade_total: u32,

    // Mixing state.
    pub(crate) ramp_samples: u32,
    pub(crate) dry_rofs: i32,
    pub(crate) dry_lofs: i32,
    pub(crate) vu_left: u32,
    pub(crate) vu_right: u32,
    pub(crate) mix_stat: u32,
    pub(crate) prng: Prng,
    pub(crate) eq: Equalizer,
    pub(crate) midi_queue: Vec<MidiEvent>,
    pub(crate) frames_rendered: u64,
}

impl Player {
    /// Build a player around a song. The song should have been through
    /// [`Song::sanitize`] and [`Song::validate`]; the player re-sanitizes
    /// defensively since it trusts those bounds on the render path.
    pub fn new(mut song: Song, config: MixerConfig) -> Self {
        song.sanitize();
        let mut player = Self {
            song,
            config: MixerConfig::default(),
            voices: vec![Voice::default(); MAX_VOICES],
            voice_mix: Vec::with_capacity(MAX_VOICES),
            mix_buffer: vec![0; MIXBUFFER_SIZE * 2],
            current_order: 0,
            process_order: 0,
            current_pattern: 0,
            row: 0,
            process_row: 0,
            break_row: 0,
            tick_count: 1,
            row_count: 0,
            current_speed: 6,
            current_tempo: 125,
            current_global_volume: 128,
            buffer_count: 0,
            frame_delay: 0,
            repeat_count: 0,
            pattern_loop_active: false,
            first_tick: false,
            end_reached: false,
            paused: false,
            pattern_playback: false,
            pattern_playback_started: false,
            order_locked: false,
            stop_at_order: -1,
            stop_at_row: -1,
            step_remaining: None,
            fade_samples: 0,
            fade_total: 0,
            ramp_samples: 64,
            dry_rofs: 0,
            dry_lofs: 0,
            vu_left: 0,
            vu_right: 0,
            mix_stat: 0,
            prng: Prng::new(),
            eq: Equalizer::default(),
            midi_queue: Vec::with_capacity(64),
            frames_rendered: 0,
        };
        player.configure(config);
        player.start();
        player
    }

    /// Apply a new mixer configuration. Derived state (ramp length, EQ
    /// coefficients) is recomputed here so the render path never does.
    pub fn configure(&mut self, mut config: MixerConfig) {
        config.sanitize();
        self.ramp_samples =
            ((config.sample_rate * VOLUME_RAMP_LENGTH) / 100_000).max(8);
        if config.flags.contains(MixerFlags::NO_RAMPING) {
            self.ramp_samples = 2;
        }
        self.dry_rofs = 0;
        self.dry_lofs = 0;
        self.eq.initialize(true, config.sample_rate as f32);
        debug!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            bits = config.bit_depth.bits(),
            "mixer configured"
        );
        self.config = config;
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn song(&self) -> &Song {
        &self.song
    }

    /// Mutable song access for editors; take the player lock around this
    /// plus any dependent reads to present the renderer an atomic view.
    pub fn song_mut(&mut self) -> &mut Song {
        &mut self.song
    }

    /// Set EQ band boosts (0-32 each) and optional center frequencies.
    pub fn set_eq(&mut self, gains: &[u32], freqs: Option<&[u32]>) {
        self.eq.set_gains(gains, freqs, self.config.sample_rate as f32);
    }

    /// How many times the song plays before the terminal order ends it;
    /// 0 means forever.
    pub fn set_repeat_count(&mut self, count: u32) {
        self.repeat_count = -(count as i32);
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Reset every voice to its channel defaults and rewind the clock.
    fn reset_voices(&mut self) {
        for (i, voice) in self.voices.iter_mut().enumerate() {
            *voice = Voice::default();
            if i < MAX_CHANNELS {
                let chan = &self.song.channels[i];
                voice.panning = chan.panning as i32;
                voice.channel_volume = chan.volume as i32;
                voice.muted = chan.muted;
                voice.surround = chan.surround;
            }
        }
        self.current_global_volume = self.song.initial_global_volume;
        self.current_speed = self.song.initial_speed;
        self.current_tempo = self.song.initial_tempo;
    }

    /// Position the sequencer at an order, clearing transient voice state.
    /// Order 0 is a full restart; anything else keeps the voices sounding.
    pub fn set_current_order(&mut self, position: u32) {
        for voice in &mut self.voices {
            voice.period = 0;
            voice.note = 0;
            voice.new_note = 0;
            voice.new_instrument = 0;
            voice.portamento_target = 0;
            voice.active_fx = crate::voice::ContinuedFx::None;
            voice.cd_pattern_loop = 0;
            voice.pattern_loop_row = 0;
            voice.cd_tremor = 0;
            voice.vibrato_position = if self.song.old_effects() { 0 } else { 0x10 };
            voice.tremolo_position = 0;
        }
        let position = if position > cinder_song::MAX_ORDERS as u32 {
            0
        } else {
            position
        };
        if position == 0 {
            self.reset_voices();
            self.prng.reseed();
        }

        self.process_order = position as i32 - 1;
        self.process_row = PROCESS_NEXT_ORDER;
        self.row = 0;
        self.break_row = 0;
        self.tick_count = 1;
        self.row_count = 0;
        self.buffer_count = 0;
        self.frames_rendered = 0;
        self.midi_queue.clear();
        self.fade_samples = 0;
        self.fade_total = 0;
        self.pattern_playback = false;
        self.pattern_playback_started = false;
        self.pattern_loop_active = false;
        self.end_reached = false;
        self.paused = false;
    }

    /// Start playback from the top of the order list.
    pub fn start(&mut self) {
        self.set_current_order(0);
    }

    /// Start playback at a given order.
    pub fn start_at_order(&mut self, order: u32) {
        self.set_current_order(0);
        self.set_current_order(order);
    }

    /// Start playback at an order and row.
    pub fn start_at(&mut self, order: u32, row: u32) {
        self.start_at_order(order);
        self.break_row = row;
    }

    /// Loop one pattern forever (or until the repeat count runs out),
    /// starting at `row`.
    pub fn loop_pattern(&mut self, pattern: u32, row: u32) {
        if self.song.pattern(pattern as u8).is_none() {
            self.pattern_playback = false;
            return;
        }
        self.process_order = 0;
        self.process_row = PROCESS_NEXT_ORDER;
        self.break_row = row;
        self.tick_count = 1;
        self.row_count = 0;
        self.current_pattern = pattern;
        self.buffer_count = 0;
        self.end_reached = false;
        self.paused = false;
        self.pattern_playback = true;
        self.pattern_playback_started = false;
    }

    /// Stop and silence everything immediately.
    pub fn stop(&mut self) {
        self.end_reached = true;
        for voice in &mut self.voices {
            voice.stop();
            voice.left_volume = 0;
            voice.right_volume = 0;
        }
        self.dry_rofs = 0;
        self.dry_lofs = 0;
        self.vu_left = 0;
        self.vu_right = 0;
    }

    /// Fade the whole mix to silence over `frames`, then end.
    pub fn stop_with_fade(&mut self, frames: u32) {
        let frames = frames.max(1);
        self.fade_samples = frames;
        self.fade_total = frames;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.step_remaining = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// From pause, play exactly one row and pause again.
    pub fn single_step(&mut self) {
        self.paused = false;
        self.step_remaining = Some(self.current_speed.max(1));
    }

    /// Make `render` report end-of-song once playback reaches (or passes)
    /// this order and row; used by chase and export.
    pub fn stop_at(&mut self, order: u32, row: u32) {
        self.stop_at_order = order as i32;
        self.stop_at_row = row as i32;
    }

    pub fn clear_stop_at(&mut self) {
        self.stop_at_order = -1;
        self.stop_at_row = -1;
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            order: self.current_order,
            pattern: self.current_pattern,
            row: self.row,
            tick: self.current_speed.saturating_sub(self.tick_count),
            speed: self.current_speed,
            tempo: self.current_tempo,
            global_volume: self.current_global_volume,
            vu_left: self.vu_left,
            vu_right: self.vu_right,
            mixed_voices: self.mix_stat,
            end_reached: self.end_reached,
        }
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    /// Mark `out[n]` true for every sample slot currently playing.
    pub fn playing_samples(&self, out: &mut [bool]) {
        out.fill(false);
        for voice in &self.voices {
            if let Some(slot) = voice.sample.filter(|_| voice.is_active()) {
                if let Some(flag) = out.get_mut(slot as usize) {
                    *flag = true;
                }
            }
        }
    }

    /// Mark `out[n]` true for every instrument slot currently playing.
    pub fn playing_instruments(&self, out: &mut [bool]) {
        out.fill(false);
        for voice in &self.voices {
            if let Some(slot) = voice.instrument.filter(|_| voice.is_active()) {
                if let Some(flag) = out.get_mut(slot as usize) {
                    *flag = true;
                }
            }
        }
    }

    /// Mute or unmute a pattern channel (and its background voices).
    pub fn set_channel_mute(&mut self, channel: usize, muted: bool) {
        if channel >= MAX_CHANNELS {
            return;
        }
        self.voices[channel].muted = muted;
        for i in MAX_CHANNELS..MAX_VOICES {
            if self.voices[i].master_channel == channel as u32 + 1 {
                self.voices[i].muted = muted;
                self.voices[i].nna_muted = muted;
            }
        }
    }

    /// Drain MIDI events queued since the last call (for the export sink).
    pub(crate) fn take_midi(&mut self, into: &mut Vec<MidiEvent>) {
        into.append(&mut self.midi_queue);
    }

    // =========================================================================
    // Render
    // =========================================================================

    /// Render PCM into `out` in the configured format. Returns the number
    /// of frames produced; fewer than requested means the song ended this
    /// call (the remainder of `out` is silence-filled).
    pub fn render(&mut self, out: &mut [u8]) -> usize {
        let frame_bytes = self.config.frame_bytes();
        let max = out.len() / frame_bytes;
        if max == 0 {
            return 0;
        }

        if self.end_reached {
            silence(&self.config, &mut out[..max * frame_bytes]);
            return 0;
        }

        let mut vu = VuTracker::new();
        let mut bufleft = max;
        let mut written = 0usize;
        let mut chunks = 0u32;
        let mut mixed_total = 0u32;

        while bufleft > 0 {
            if self.buffer_count == 0 {
                if !self.read_note() {
                    self.end_reached = true;
                    debug!(
                        order = self.current_order,
                        row = self.row,
                        "end of song"
                    );
                    if self.stop_at_order > -1 {
                        return 0;
                    }
                    break;
                }
                if self.buffer_count == 0 {
                    break;
                }
            }

            let count = (self.buffer_count as usize)
                .min(MIXBUFFER_SIZE)
                .min(bufleft);
            if count == 0 {
                break;
            }

            stereo_fill(
                &mut self.mix_buffer,
                count,
                &mut self.dry_rofs,
                &mut self.dry_lofs,
            );
            mixed_total += self.create_stereo_mix(count);
            chunks += 1;

            let stereo_out = self.config.channels >= 2;
            if !stereo_out {
                mono_from_stereo(&mut self.mix_buffer, count);
            }

            if self.config.flags.contains(MixerFlags::EQ) {
                if stereo_out {
                    self.eq.process_stereo(&mut self.mix_buffer, count);
                } else {
                    self.eq.process_mono(&mut self.mix_buffer, count);
                }
            }

            // Global fade on stop_with_fade: scale the chunk, end at zero.
            if self.fade_total != 0 {
                let samples = if stereo_out { count * 2 } else { count };
                for s in &mut self.mix_buffer[..samples] {
                    *s = muldiv(*s, self.fade_samples as i32, self.fade_total as i32);
                }
                self.fade_samples = self.fade_samples.saturating_sub(count as u32);
                if self.fade_samples == 0 {
                    self.end_reached = true;
                }
            }

            written += convert_chunk(
                &self.config,
                &self.mix_buffer,
                count,
                &mut out[written..],
                &mut vu,
            );

            bufleft -= count;
            self.buffer_count -= count as u32;
            self.frames_rendered += count as u64;

            if self.end_reached {
                break;
            }
        }

        let rendered = max - bufleft;
        if bufleft > 0 {
            silence(&self.config, &mut out[rendered * frame_bytes..max * frame_bytes]);
        }

        let (vl, vr) = vu.levels();
        self.vu_left = vl;
        self.vu_right = vr;
        if chunks > 0 {
            self.mix_stat = (mixed_total + chunks - 1) / chunks;
        }

        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prng_is_deterministic() {
        let mut a = Prng::new();
        let mut b = Prng::new();
        let seq_a: Vec<u32> = (0..16).map(|_| a.next()).collect();
        let seq_b: Vec<u32> = (0..16).map(|_| b.next()).collect();
        assert_eq!(seq_a, seq_b);

        a.reseed();
        assert_eq!(a.next(), seq_a[0]);
    }

    #[test]
    fn prng_wave_range() {
        let mut p = Prng::new();
        for _ in 0..1000 {
            let w = p.wave();
            assert!((-64..=63).contains(&w));
        }
        for _ in 0..1000 {
            let b = p.bipolar();
            assert!((-1.0..=1.0).contains(&b));
        }
    }

    #[test]
    fn repeat_count_mapping() {
        let mut player = crate::tests::player_for(crate::tests::one_note_song());
        player.set_repeat_count(1);
        assert_eq!(player.repeat_count, -1);
        player.set_repeat_count(0);
        assert_eq!(player.repeat_count, 0);
    }
}
