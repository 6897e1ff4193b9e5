//! The tick/row/order clock.
//!
//! [`Player::process_tick`] is the heartbeat: it counts ticks down to row
//! boundaries, latches pattern cells into the channel voices, and walks the
//! order list at pattern ends. [`Player::read_note`] wraps it with the
//! per-tick voice update and computes how many frames the tick lasts.

use cinder_song::{Pattern, DEFAULT_PATTERN_ROWS, MAX_CHANNELS, ORDER_LAST, ORDER_SKIP};
use tracing::{debug, trace};

use crate::player::Player;
use crate::voice::ContinuedFx;

/// Sentinel for "advance to the next order before playing another row".
pub(crate) const PROCESS_NEXT_ORDER: u32 = 0xFFFE;

/// Pattern numbers at or above this can never be real patterns.
pub(crate) const MAX_PATTERN_NUM: u32 = cinder_song::MAX_PATTERNS as u32;

impl Player {
    /// Order list entry, with everything past the end reading as terminal.
    pub(crate) fn order_at(&self, index: i32) -> u8 {
        if index < 0 {
            return ORDER_LAST;
        }
        self.song
            .orders
            .get(index as usize)
            .copied()
            .unwrap_or(ORDER_LAST)
    }

    /// Number of rows in the current pattern, synthesizing a blank pattern
    /// in place of a missing or zero-row one.
    fn current_pattern_rows(&mut self) -> u32 {
        let n = self.current_pattern as usize;
        if n >= self.song.patterns.len() {
            self.song.patterns.resize_with(n + 1, || None);
        }
        let slot = &mut self.song.patterns[n];
        match slot {
            Some(p) if !p.is_empty() => p.rows() as u32,
            _ => {
                debug!(pattern = n, "synthesizing blank pattern");
                *slot = Some(Pattern::blank(DEFAULT_PATTERN_ROWS));
                DEFAULT_PATTERN_ROWS as u32
            }
        }
    }

    /// Move to the next order (or handle single-pattern playback). Returns
    /// false when the song has ended.
    fn increment_order(&mut self) -> bool {
        self.process_row = self.break_row;
        self.break_row = 0;

        if self.pattern_playback {
            // Looping one pattern: no order walk, but count a repeat each
            // time the pattern wraps (the first entry does not count).
            if self.pattern_playback_started {
                self.repeat_count += 1;
                if self.repeat_count == 0 {
                    self.process_row = PROCESS_NEXT_ORDER;
                    return false;
                }
                if self.repeat_count < 0 {
                    self.repeat_count = 1; // overflowed
                }
            } else {
                self.pattern_playback_started = true;
            }
        } else if !self.order_locked {
            loop {
                self.process_order += 1;
                if self.order_at(self.process_order) != ORDER_SKIP {
                    break;
                }
            }

            if self.order_at(self.process_order) == ORDER_LAST {
                self.repeat_count += 1;
                if self.repeat_count == 0 {
                    self.process_row = PROCESS_NEXT_ORDER;
                    return false;
                }
                if self.repeat_count < 0 {
                    self.repeat_count = 1; // overflowed
                }

                self.process_order = 0;
                while self.order_at(self.process_order) == ORDER_SKIP {
                    self.process_order += 1;
                }
            }

            if self.order_at(self.process_order) as u32 >= MAX_PATTERN_NUM {
                // Out-of-range pattern number; treat as the end.
                self.process_row = PROCESS_NEXT_ORDER;
                return false;
            }

            self.current_order = self.process_order as u32;
            self.current_pattern = self.order_at(self.process_order) as u32;
        }

        self.current_pattern_rows();
        true
    }

    /// Advance the clock by one tick. Returns false at end of song.
    pub(crate) fn process_tick(&mut self) -> bool {
        self.first_tick = false;
        self.tick_count -= 1;
        if self.tick_count == 0 {
            self.tick_count = self.current_speed;
            self.row_count -= 1;
            if self.row_count <= 0 {
                // Zero rather than one: a pattern delay to the left of this
                // row sets row_count to value + 1, and SEx on the same row
                // must see it nonzero to know it lost.
                self.row_count = 0;
                self.frame_delay = 0;

                self.process_row = self.process_row.wrapping_add(1);
                if self.process_row >= self.current_pattern_rows() && !self.increment_order() {
                    return false;
                }
                self.row = self.process_row;
                self.first_tick = true;
            }
            // On a pattern-delay repeat this latches the same row again with
            // first_tick clear, which is exactly what SEx wants.
            self.latch_row();
            self.process_effects(true);
        } else {
            self.process_effects(false);
        }
        true
    }

    /// Copy the current row's cells into the channel voices and reset the
    /// per-row modulation enables.
    fn latch_row(&mut self) {
        let rows = self.current_pattern_rows();
        let row = self.row.min(rows - 1);
        let Some(pattern) = &self.song.patterns[self.current_pattern as usize] else {
            return; // current_pattern_rows just put one there
        };

        for chan in 0..MAX_CHANNELS {
            let cell = *pattern.cell(row as u16, chan);
            let voice = &mut self.voices[chan];

            voice.row_note = cell.note;
            if cell.instrument != 0 {
                voice.last_instrument = cell.instrument;
            }
            voice.row_instr = cell.instrument;
            voice.row_volcmd = cell.volume;
            voice.row_command = cell.command;

            voice.left_volume = voice.left_volume_new;
            voice.right_volume = voice.right_volume_new;
            voice.portamento_on = false;
            voice.vibrato_on = false;
            voice.tremolo_on = false;
            voice.active_fx = ContinuedFx::None;
        }
    }

    /// One tick of the paused clock: keep effects and envelopes alive but
    /// never latch pattern data or advance rows.
    fn process_paused_tick(&mut self) {
        if self.current_speed == 0 {
            self.current_speed = self.song.initial_speed.max(1);
        }
        if self.current_tempo == 0 {
            self.current_tempo = self.song.initial_tempo.max(32);
        }
        self.first_tick = false;

        self.tick_count -= 1;
        if self.tick_count == 0 {
            self.tick_count = self.current_speed;
            self.row_count = (self.row_count - 1).max(0);
            for voice in self.voices.iter_mut().take(MAX_CHANNELS) {
                voice.row_note = 0;
                voice.row_instr = 0;
                voice.row_volcmd = cinder_song::VolumeCommand::None;
                voice.row_command = cinder_song::Command::None;
                voice.active_fx = ContinuedFx::None;
            }
        }
        self.process_effects(false);
    }

    /// Advance one tick and set every active voice up for mixing. Returns
    /// false when playback has finished and nothing more should render.
    pub(crate) fn read_note(&mut self) -> bool {
        if self.paused {
            self.process_paused_tick();
        } else {
            if !self.process_tick() {
                return false;
            }
            if let Some(left) = self.step_remaining.as_mut() {
                *left -= 1;
                if *left == 0 {
                    self.step_remaining = None;
                    self.paused = true;
                }
            }
        }

        if self.current_tempo == 0 {
            return false;
        }

        // Frames in this tick: the classic 2.5/tempo seconds per tick,
        // scaled by the tempo factor (128 = 1.0).
        self.buffer_count =
            (self.config.sample_rate * 5 * self.config.tempo_factor) / (self.current_tempo << 8);

        // Stop-at position for chase/export use.
        if self.stop_at_order > -1
            && self.stop_at_row > -1
            && self.stop_at_order <= self.current_order as i32
            && self.stop_at_row <= self.row as i32
        {
            return false;
        }

        trace!(
            order = self.current_order,
            row = self.row,
            tick = self.current_speed - self.tick_count,
            "tick"
        );

        self.update_voices();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{one_note_song, player_for};

    #[test]
    fn speed_controls_ticks_per_row() {
        let mut player = player_for(one_note_song());
        // initial_speed 6: first tick is a row boundary, five more are not.
        assert!(player.read_note());
        assert_eq!(player.row, 0);
        assert!(player.first_tick);
        for _ in 0..5 {
            assert!(player.read_note());
            assert!(!player.first_tick);
            assert_eq!(player.row, 0);
        }
        assert!(player.read_note());
        assert_eq!(player.row, 1);
    }

    #[test]
    fn buffer_count_matches_tempo_formula() {
        let mut player = player_for(one_note_song());
        assert!(player.read_note());
        // 44100 * 5 * 128 / (125 << 8) = 882 frames per tick at 125 BPM.
        assert_eq!(player.buffer_count, 882);
    }

    #[test]
    fn skip_markers_are_skipped() {
        let mut song = one_note_song();
        song.orders = vec![ORDER_SKIP, ORDER_SKIP, 0, ORDER_LAST];
        let mut player = player_for(song);
        assert!(player.read_note());
        assert_eq!(player.current_order, 2);
        assert_eq!(player.current_pattern, 0);
    }

    #[test]
    fn terminal_order_ends_after_one_pass() {
        let mut player = player_for(one_note_song());
        player.set_repeat_count(1);
        let rows = 64;
        let speed = 6;
        for _ in 0..rows * speed {
            assert!(player.read_note());
        }
        assert!(!player.read_note(), "terminal marker ends the song");
    }

    #[test]
    fn infinite_repeat_wraps_to_start() {
        let mut player = player_for(one_note_song());
        player.set_repeat_count(0);
        let rows = 64;
        let speed = 6;
        for _ in 0..rows * speed {
            assert!(player.read_note());
        }
        assert!(player.read_note(), "repeat 0 loops instead of ending");
        assert_eq!(player.current_order, 0);
        assert_eq!(player.row, 0);
    }

    #[test]
    fn missing_pattern_is_synthesized() {
        let mut song = one_note_song();
        song.orders = vec![3, ORDER_LAST]; // pattern 3 was never allocated
        let mut player = player_for(song);
        assert!(player.read_note());
        assert_eq!(player.current_pattern, 3);
        let pat = player.song.pattern(3).expect("blank pattern allocated");
        assert_eq!(pat.rows(), DEFAULT_PATTERN_ROWS);
    }
}
