//! Effect dispatch and note triggering.
//!
//! Runs once per channel per tick, after the sequencer has latched the row.
//! Tick 0 of a row handles note/instrument triggers and "set" commands;
//! later ticks run the continuations (slides, vibrato, retrigger counters).
//! The quirks preserved here are load-bearing: fine slides re-fire on
//! pattern-delay repeats, tremor keeps counting across rows, and a note with
//! an instrument that maps to no sample swallows its whole pattern cell.

use cinder_song::{
    note_is_control, note_is_note, Command, Instrument, NewNoteAction, VolumeCommand,
    DuplicateCheckAction, DuplicateCheckType, MAX_CHANNELS, NOTE_CUT, NOTE_FIRST, NOTE_LAST,
    NOTE_NONE, NOTE_OFF, Waveform,
};

use crate::export::MidiEvent;
use crate::pitch::{
    period_extra_fine_slide, period_fine_slide, period_from_note, period_slide,
};
use crate::player::{Player, Prng};
use crate::sequencer::PROCESS_NEXT_ORDER;
use crate::tables::{waveform_value, RETRIG_ADD, RETRIG_MUL, VC_PORTAMENTO};
use crate::voice::{ContinuedFx, Voice};
use crate::{muldivr, MAX_VOICES};

// =============================================================================
// Stateless slide helpers
// =============================================================================

fn fx_volume_up(voice: &mut Voice, param: u32) {
    voice.volume = (voice.volume + param as i32 * 4).min(256);
}

fn fx_volume_down(voice: &mut Voice, param: u32) {
    voice.volume = (voice.volume - param as i32 * 4).max(0);
}

/// Dxy and friends. Tested in the classic order: Dx0, D0x, DxF, DFx.
fn fx_volume_slide(voice: &mut Voice, first_tick: bool, param: u8) {
    let param = if param != 0 {
        voice.mem_volslide = param;
        param as u32
    } else {
        voice.mem_volslide as u32
    };

    if param == (param & 0xF0) {
        // Dx0: slide up each non-first tick; x = F also acts immediately.
        let x = param >> 4;
        if x == 0xF || !first_tick {
            fx_volume_up(voice, x);
        }
    } else if param == (param & 0x0F) {
        // D0x: slide down; x = F also acts immediately.
        if param == 0xF || !first_tick {
            fx_volume_down(voice, param);
        }
    } else if (param & 0x0F) == 0x0F {
        // DxF: fine slide up on the first tick only.
        if first_tick {
            fx_volume_up(voice, param >> 4);
        }
    } else if (param & 0xF0) == 0xF0 {
        // DFx: fine slide down on the first tick only.
        if first_tick {
            fx_volume_down(voice, param & 0x0F);
        }
    }
}

fn fx_panning_slide(voice: &mut Voice, first_tick: bool, param: u8) {
    let param = if param != 0 {
        voice.mem_panslide = param;
        param as i32
    } else {
        voice.mem_panslide as i32
    };

    let mut slide = 0;
    if (param & 0x0F) == 0x0F && (param & 0xF0) != 0 {
        if first_tick {
            slide = -((param & 0xF0) >> 2);
        }
    } else if (param & 0xF0) == 0xF0 && (param & 0x0F) != 0 {
        if first_tick {
            slide = (param & 0x0F) << 2;
        }
    } else if !first_tick {
        if param & 0x0F != 0 {
            slide = (param & 0x0F) << 2;
        } else {
            slide = -((param & 0xF0) >> 2);
        }
    }
    if slide != 0 {
        voice.panning = (voice.panning + slide).clamp(0, 256);
        voice.saved_pan = None;
    }
    voice.surround = false;
    voice.panbrello_delta = 0;
}

fn fx_channel_vol_slide(voice: &mut Voice, first_tick: bool, param: u8) {
    let param = if param != 0 {
        voice.mem_channel_volslide = param;
        param as i32
    } else {
        voice.mem_channel_volslide as i32
    };

    let mut slide = 0;
    if (param & 0x0F) == 0x0F && (param & 0xF0) != 0 {
        if first_tick {
            slide = param >> 4;
        }
    } else if (param & 0xF0) == 0xF0 && (param & 0x0F) != 0 {
        if first_tick {
            slide = -(param & 0x0F);
        }
    } else if !first_tick {
        if param & 0x0F != 0 {
            slide = -(param & 0x0F);
        } else {
            slide = (param & 0xF0) >> 4;
        }
    }
    if slide != 0 {
        voice.channel_volume = (voice.channel_volume + slide).clamp(0, 64);
    }
}

fn fx_vibrato(voice: &mut Voice, param: u8) {
    if param & 0x0F != 0 {
        voice.vibrato_depth = (param as u32 & 0x0F) * 4;
    }
    if param & 0xF0 != 0 {
        voice.vibrato_speed = (param as u32 >> 4) & 0x0F;
    }
    voice.vibrato_on = true;
}

fn fx_fine_vibrato(voice: &mut Voice, param: u8) {
    if param & 0x0F != 0 {
        voice.vibrato_depth = param as u32 & 0x0F;
    }
    if param & 0xF0 != 0 {
        voice.vibrato_speed = (param as u32 >> 4) & 0x0F;
    }
    voice.vibrato_on = true;
}

/// Tremolo computes its delta here, every tick it is dispatched; the
/// modulation pipeline just adds the stored delta.
fn fx_tremolo(voice: &mut Voice, prng: &mut Prng, first_tick: bool, old_effects: bool, param: u8) {
    if param & 0x0F != 0 {
        voice.tremolo_depth = (param as i32 & 0x0F) << 2;
    }
    if param & 0xF0 != 0 {
        voice.tremolo_speed = (param as u32 >> 4) & 0x0F;
    }
    voice.tremolo_on = true;

    if first_tick && old_effects {
        return;
    }

    let pos = voice.tremolo_position & 0xFF;
    let delta = waveform_value(voice.tremolo_type, pos as u8, prng.wave());
    voice.tremolo_position = (pos + 4 * voice.tremolo_speed) & 0xFF;
    voice.tremolo_delta = (delta * voice.tremolo_depth) >> 5;
}

/// Panbrello: like tremolo but for panning, with its own phase rules for
/// the random waveform (the speed says how long each value holds).
fn fx_panbrello(voice: &mut Voice, prng: &mut Prng, param: u8) {
    if param & 0x0F != 0 {
        voice.panbrello_depth = param as i32 & 0x0F;
    }
    if param & 0xF0 != 0 {
        voice.panbrello_speed = (param as u32 >> 4) & 0x0F;
    }

    let pos = voice.panbrello_position & 0xFF;
    let delta = waveform_value(voice.panbrello_type, pos as u8, prng.wave());

    if voice.panbrello_type == Waveform::Random {
        if voice.panbrello_position == 0 || voice.panbrello_position >= voice.panbrello_speed {
            voice.panbrello_position = 0;
        }
        voice.panbrello_position += 1;
    } else {
        voice.panbrello_position = pos + voice.panbrello_speed;
    }

    voice.panbrello_delta = delta;
}

fn fx_fine_portamento_up(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    if first_tick && voice.period != 0 && param != 0 {
        voice.period = period_fine_slide(voice.period, -(param as i32 & 0x0F), linear);
    }
}

fn fx_fine_portamento_down(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    if first_tick && voice.period != 0 && param != 0 {
        voice.period = period_fine_slide(voice.period, param as i32 & 0x0F, linear);
    }
}

fn fx_extra_fine_portamento_up(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    if first_tick && voice.period != 0 && param != 0 {
        voice.period = period_extra_fine_slide(voice.period, -(param as i32 & 0x0F), linear);
    }
}

fn fx_extra_fine_portamento_down(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    if first_tick && voice.period != 0 && param != 0 {
        voice.period = period_extra_fine_slide(voice.period, param as i32 & 0x0F, linear);
    }
}

fn fx_reg_portamento_up(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    if !first_tick {
        voice.period = period_slide(voice.period, -(param as i32 * 4), linear);
    }
}

fn fx_reg_portamento_down(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    if !first_tick {
        voice.period = period_slide(voice.period, param as i32 * 4, linear);
    }
}

fn fx_portamento_up(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    match param & 0xF0 {
        0xE0 => fx_extra_fine_portamento_up(voice, linear, first_tick, param & 0x0F),
        0xF0 => fx_fine_portamento_up(voice, linear, first_tick, param & 0x0F),
        _ => fx_reg_portamento_up(voice, linear, first_tick, param),
    }
}

fn fx_portamento_down(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    match param & 0xF0 {
        0xE0 => fx_extra_fine_portamento_down(voice, linear, first_tick, param & 0x0F),
        0xF0 => fx_fine_portamento_down(voice, linear, first_tick, param & 0x0F),
        _ => fx_reg_portamento_down(voice, linear, first_tick, param),
    }
}

/// Gxx: slide the period toward the portamento target, clamping exactly on
/// arrival. In linear mode the step is guaranteed to move at least one unit
/// so slow slides on high periods cannot stall.
fn fx_tone_portamento(voice: &mut Voice, linear: bool, first_tick: bool, param: u8) {
    voice.portamento_on = true;
    if voice.period == 0 || voice.portamento_target == 0 || first_tick {
        return;
    }

    let param = param as i32;
    if voice.period < voice.portamento_target {
        let delta = if linear {
            let n = param.min(255) as usize;
            (muldivr(
                voice.period,
                crate::tables::LINEAR_SLIDE_UP[n] as i32,
                65536,
            ) - voice.period)
                .max(1)
        } else {
            param * 4
        };
        voice.period += delta;
        if voice.period > voice.portamento_target {
            voice.period = voice.portamento_target;
            voice.portamento_target = 0;
        }
    } else if voice.period > voice.portamento_target {
        let delta = if linear {
            let n = param.min(255) as usize;
            (muldivr(
                voice.period,
                crate::tables::LINEAR_SLIDE_DOWN[n] as i32,
                65536,
            ) - voice.period)
                .min(-1)
        } else {
            -param * 4
        };
        voice.period += delta;
        if voice.period < voice.portamento_target {
            voice.period = voice.portamento_target;
            voice.portamento_target = 0;
        }
    }
}

/// Reset envelope cursors (honoring carry flags unless `always`) and rewind
/// the fade accumulator.
fn env_reset(voice: &mut Voice, instrument: Option<&Instrument>, always: bool) {
    if let Some(ins) = instrument {
        voice.fast_ramp = true;
        if always {
            voice.vol_env_position = 0;
            voice.pan_env_position = 0;
            voice.pitch_env_position = 0;
        } else {
            if !ins.volume_envelope.carries() {
                voice.vol_env_position = 0;
            }
            if !ins.panning_envelope.carries() {
                voice.pan_env_position = 0;
            }
            if !ins.pitch_envelope.carries() {
                voice.pitch_env_position = 0;
            }
        }
    }
    voice.fadeout_volume = 65536;
}

/// Override the channel panning with an instrument or sample default,
/// remembering the old value so the next plain note can restore it.
fn set_instrument_panning(voice: &mut Voice, panning: i32) {
    voice.saved_pan = Some((voice.panning as u16 + 1, voice.surround));
    voice.panning = panning;
    voice.surround = false;
}

// =============================================================================
// Player-level effect processing
// =============================================================================

impl Player {
    /// Stop a voice dead. `clear_note` also forgets the period so stray
    /// instrument numbers cannot revive the old note (SCx leaves it).
    pub(crate) fn note_cut(&mut self, idx: usize, clear_note: bool) {
        let voice = &mut self.voices[idx];
        voice.fast_ramp = true;
        voice.length = 0;
        voice.increment = 0;
        if clear_note {
            voice.period = 0;
        }
        self.emit_midi_off(idx);
    }

    /// Key off: release the sustain loop and start the envelope release
    /// phase (or fade, when there is no volume envelope to release into).
    pub(crate) fn key_off(&mut self, idx: usize) {
        self.emit_midi_off(idx);

        let instrument_mode = self.song.instrument_mode();
        let voice = &mut self.voices[idx];
        voice.key_off = true;

        if instrument_mode && voice.instrument.is_some() && !voice.vol_env_on {
            voice.note_fade = true;
        }
        if voice.length == 0 {
            return;
        }

        if voice.sustain_engaged {
            if let Some(smp) = voice.sample.and_then(|s| self.song.sample(s)) {
                voice.sustain_engaged = false;
                if smp.has_loop() {
                    voice.loop_kind = if smp.is_pingpong_loop() {
                        crate::LoopKind::PingPong
                    } else {
                        voice.reverse = false;
                        crate::LoopKind::Forward
                    };
                    voice.length = smp.length;
                    voice.loop_start = smp.loop_start;
                    voice.loop_end = smp.loop_end;
                    if voice.length > voice.loop_end {
                        voice.length = voice.loop_end;
                    }
                    if voice.position >= voice.length as i32 {
                        voice.position = voice.position - voice.length as i32
                            + voice.loop_start as i32;
                    }
                } else {
                    voice.loop_kind = crate::LoopKind::None;
                    voice.reverse = false;
                    voice.length = smp.length;
                }
            }
        }

        let voice = &self.voices[idx];
        if let Some(ins) = voice.instrument.and_then(|i| self.song.instrument(i)) {
            if ins.fadeout != 0 && ins.volume_envelope.has_loop() {
                self.voices[idx].note_fade = true;
            }
        }
    }

    /// Find (or steal) a background voice slot for an NNA clone.
    fn nna_channel(&mut self, idx: usize) -> Option<usize> {
        for i in MAX_CHANNELS..MAX_VOICES {
            let v = &mut self.voices[i];
            if v.length == 0 {
                if v.muted {
                    if v.nna_muted {
                        v.nna_muted = false;
                        v.muted = false;
                    } else {
                        continue; // deliberately muted; leave it alone
                    }
                }
                return Some(i);
            }
        }

        if self.voices[idx].fadeout_volume == 0 {
            return None;
        }

        // All in use: steal the quietest fading voice, preferring the one
        // furthest along its volume envelope.
        let mut result = None;
        let mut best_vol: u32 = 64 * 65536; // only voices under 25%
        let mut best_envpos = 0xFF_FFFF;
        for j in MAX_CHANNELS..MAX_VOICES {
            let v = &self.voices[j];
            if v.fadeout_volume == 0 {
                return Some(j);
            }
            let mut vol = v.volume as u32;
            if v.note_fade {
                vol *= v.fadeout_volume as u32;
            } else {
                vol <<= 16;
            }
            if v.loop_kind.is_loop() {
                vol >>= 1;
            }
            if vol < best_vol || (vol == best_vol && v.vol_env_position > best_envpos) {
                best_envpos = v.vol_env_position;
                best_vol = vol;
                result = Some(j);
            }
        }
        if let Some(j) = result {
            self.voices[j].muted = false;
            self.voices[j].nna_muted = false;
        }
        result
    }

    /// Clone a channel voice into a background slot, with the per-row
    /// modulation disarmed so the clone keeps sounding plain.
    fn clone_to_background(&mut self, idx: usize, target: usize) {
        let mut clone = self.voices[idx].clone();
        clone.vibrato_on = false;
        clone.tremolo_on = false;
        clone.portamento_on = false;
        clone.panbrello_delta = 0;
        clone.tremolo_delta = 0;
        clone.master_channel = idx as u32 + 1;
        clone.active_fx = ContinuedFx::None;
        self.voices[target] = clone;
    }

    /// New Note Action and duplicate-check processing for a note about to
    /// trigger on channel `idx`.
    pub(crate) fn check_nna(&mut self, idx: usize, instr: u8, note: u8, force_cut: bool) {
        if !note_is_note(note) {
            return;
        }

        let instrument_mode = self.song.instrument_mode();
        if force_cut || !instrument_mode {
            let voice = &self.voices[idx];
            if voice.length == 0
                || voice.muted
                || (voice.left_volume == 0 && voice.right_volume == 0)
            {
                return;
            }
            let Some(n) = self.nna_channel(idx) else { return };
            self.clone_to_background(idx, n);
            let bkg = &mut self.voices[n];
            bkg.fadeout_volume = 0;
            bkg.note_fade = true;
            bkg.fast_ramp = true;
            let voice = &mut self.voices[idx];
            voice.length = 0;
            voice.position = 0;
            voice.position_frac = 0;
            voice.rofs = 0;
            voice.lofs = 0;
            voice.left_volume = 0;
            voice.right_volume = 0;
            return;
        }

        let instr = if instr as usize >= cinder_song::MAX_INSTRUMENTS {
            0
        } else {
            instr
        };

        // Resolve the instrument and sample the new note will use; a keyboard
        // entry with no sample swallows the trigger entirely.
        let check_instr = if instr > 0 {
            instr
        } else {
            self.voices[idx].instrument.unwrap_or(0)
        };
        let mut check_sample = self.voices[idx].sample;
        if let Some(ins) = self.song.instrument(check_instr) {
            let n = ins.keyboard[(note - 1) as usize].sample;
            if n > 0 && self.song.sample(n).is_some() {
                check_sample = Some(n);
            } else {
                return;
            }
        }
        if self.voices[idx].instrument.is_none() {
            return;
        }

        // Duplicate checks against this channel and its background voices.
        for i in idx..MAX_VOICES {
            let v = &self.voices[i];
            if !((i >= MAX_CHANNELS || i == idx)
                && (v.master_channel == idx as u32 + 1 || i == idx)
                && v.instrument.is_some())
            {
                continue;
            }
            let Some((dct, dca)) = v
                .instrument
                .and_then(|n| self.song.instrument(n))
                .map(|ins| (ins.dct, ins.dca))
            else {
                continue;
            };
            let applies = match dct {
                DuplicateCheckType::Off => false,
                DuplicateCheckType::Note => {
                    v.note == note && v.instrument == Some(check_instr)
                }
                DuplicateCheckType::Sample => {
                    check_sample.is_some()
                        && v.sample == check_sample
                        && v.instrument == Some(check_instr)
                }
                DuplicateCheckType::Instrument => v.instrument == Some(check_instr),
            };
            if applies {
                match dca {
                    DuplicateCheckAction::Cut => self.note_cut(i, true),
                    DuplicateCheckAction::NoteOff => self.key_off(i),
                    DuplicateCheckAction::NoteFade => self.voices[i].note_fade = true,
                }
                let v = &mut self.voices[i];
                if v.volume == 0 {
                    v.fadeout_volume = 0;
                    v.note_fade = true;
                    v.fast_ramp = true;
                }
            }
        }

        if self.voices[idx].muted {
            return;
        }

        // The actual New Note Action.
        let voice = &self.voices[idx];
        if voice.increment != 0 && voice.length != 0 {
            let nna = voice.nna;
            let Some(n) = self.nna_channel(idx) else { return };
            self.clone_to_background(idx, n);
            match nna {
                NewNoteAction::NoteOff => self.key_off(n),
                NewNoteAction::Cut => {
                    let bkg = &mut self.voices[n];
                    bkg.fadeout_volume = 0;
                    bkg.note_fade = true;
                }
                NewNoteAction::NoteFade => self.voices[n].note_fade = true,
                NewNoteAction::Continue => {}
            }
            let bkg = &mut self.voices[n];
            if bkg.volume == 0 {
                bkg.fadeout_volume = 0;
                bkg.note_fade = true;
                bkg.fast_ramp = true;
            }
            let voice = &mut self.voices[idx];
            voice.length = 0;
            voice.position = 0;
            voice.position_frac = 0;
            voice.rofs = 0;
            voice.lofs = 0;
        }
    }

    /// Bind a new instrument (or bare sample) to the channel, handling
    /// envelope reset/carry, swing, and the sample window swap.
    pub(crate) fn instrument_change(&mut self, idx: usize, instr: u8, porta: bool, inst_column: bool) {
        if instr as usize >= cinder_song::MAX_INSTRUMENTS {
            return;
        }
        let instrument_mode = self.song.instrument_mode();
        let compat_gxx = self.song.compat_gxx();
        let old_effects = self.song.old_effects();

        let penv_slot = if instrument_mode && self.song.instrument(instr).is_some() {
            Some(instr)
        } else {
            None
        };
        let note = self.voices[idx].new_note;
        if note == NOTE_NONE {
            return;
        }

        let old_sample = self.voices[idx].sample;
        let old_instrument_volume = self.voices[idx].instrument_volume;

        let mut sample_slot: Option<u8>;
        if let (Some(pslot), true) = (penv_slot, note_is_note(note)) {
            let Some(ins) = self.song.instrument(pslot) else { return };
            let entry = ins.keyboard[(note - 1) as usize];
            if entry.sample == 0 {
                // A key with no sample still selects the instrument.
                self.voices[idx].instrument = Some(pslot);
                return;
            }
            if entry.note > NOTE_LAST {
                return;
            }
            sample_slot = self.song.sample(entry.sample).is_some().then_some(entry.sample);
        } else if instrument_mode {
            if !note_is_control(note) {
                return;
            }
            if penv_slot.is_none() {
                let voice = &mut self.voices[idx];
                voice.instrument = None;
                voice.new_instrument = 0;
                return;
            }
            sample_slot = None;
        } else {
            sample_slot = self.song.sample(instr).is_some().then_some(instr);
        }

        if inst_column {
            if let Some(smp) = sample_slot.and_then(|s| self.song.sample(s)) {
                self.voices[idx].volume = smp.volume as i32 * 4;
            }
        }

        // Tracks the IT "carry-on" option: only a genuinely different
        // instrument resets carried envelopes.
        let inst_changed =
            self.voices[idx].instrument != penv_slot || self.voices[idx].sample.is_none();
        self.voices[idx].instrument = penv_slot;
        self.voices[idx].new_instrument = 0;

        if let Some(smp) = sample_slot.and_then(|s| self.song.sample(s)) {
            self.voices[idx].instrument_volume = match penv_slot.and_then(|p| self.song.instrument(p)) {
                Some(ins) => (smp.global_volume as i32 * ins.global_volume as i32) >> 7,
                None => smp.global_volume as i32,
            };
        }

        // Samples do not change on a bare instrument number during a
        // compatible-Gxx portamento.
        if self.voices[idx].sample.is_some()
            && sample_slot != self.voices[idx].sample
            && porta
            && self.voices[idx].increment != 0
            && compat_gxx
        {
            sample_slot = self.voices[idx].sample;
        }

        // A late instrument number after a multisample portamento keeps the
        // playing sample (only volume/panning attributes follow the new one).
        if penv_slot.is_some()
            && !inst_changed
            && sample_slot != old_sample
            && self.voices[idx].sample.is_some()
            && !note_is_note(self.voices[idx].row_note)
        {
            return;
        }

        if penv_slot.is_none() && sample_slot != old_sample && porta {
            self.voices[idx].fresh_note = true;
        }

        if let Some(pslot) = penv_slot {
            let voice_needs_reset = {
                let voice = &self.voices[idx];
                voice.length == 0
                    || (inst_column && porta && compat_gxx)
                    || (inst_column
                        && !porta
                        && (voice.note_fade || voice.key_off)
                        && old_effects)
            };
            let always = inst_changed || self.voices[idx].key_off;
            let song = &self.song;
            let ins = song.instrument(pslot);
            let voice = &mut self.voices[idx];
            if voice_needs_reset {
                env_reset(voice, ins, always);
            } else if let Some(ins) = ins {
                if !ins.volume_envelope.is_enabled() {
                    voice.vol_env_position = 0;
                }
            }

            if !porta {
                voice.vol_swing = 0;
                voice.pan_swing = 0;
                if let Some(ins) = ins {
                    if ins.volume_swing != 0 {
                        let d = self.prng.bipolar();
                        voice.vol_swing = (d * ins.volume_swing as f64 / 100.0
                            * voice.instrument_volume as f64)
                            .floor() as i32;
                    }
                    if ins.pan_swing != 0 {
                        let d = self.prng.bipolar();
                        voice.pan_swing = (d * ins.pan_swing as f64 * 4.0) as i32;
                    }
                }
            }
        }

        let Some(slot) = sample_slot else {
            let voice = &mut self.voices[idx];
            voice.sample = None;
            voice.instrument_volume = 0;
            return;
        };

        let was_key_off = self.voices[idx].key_off;

        if Some(slot) == self.voices[idx].sample && self.voices[idx].length != 0 {
            if porta && inst_changed && penv_slot.is_some() {
                let voice = &mut self.voices[idx];
                voice.key_off = false;
                voice.note_fade = false;
            }
            return;
        }

        if porta && self.voices[idx].length == 0 {
            self.voices[idx].increment = 0;
        }

        {
            let song = &self.song;
            let Some(smp) = song.sample(slot) else { return };
            let penv = penv_slot.and_then(|p| song.instrument(p));
            let voice = &mut self.voices[idx];

            voice.key_off = false;
            voice.note_fade = false;
            voice.vol_env_on = penv.is_some_and(|i| i.volume_envelope.is_enabled());
            voice.pan_env_on = penv.is_some_and(|i| i.panning_envelope.is_enabled());
            voice.pitch_env_on = penv.is_some_and(|i| i.pitch_envelope.is_enabled());
            if let Some(ins) = penv {
                if let Some(c) = ins.filter_cutoff {
                    voice.cutoff = c;
                }
                if let Some(r) = ins.filter_resonance {
                    voice.resonance = r;
                }
            }

            // Note-off with an instrument in old-effects mode: adopt the new
            // sample's volume/panning but keep playing the released sample.
            if voice.row_note == NOTE_OFF && old_effects && sample_slot != old_sample {
                if let Some(old) = voice.sample.and_then(|s| song.sample(s)) {
                    voice.adopt_sample_loops(old);
                }
                if let Some(pan) = smp.default_pan {
                    voice.panning = pan as i32 * 4;
                }
                voice.instrument_volume = old_instrument_volume;
                voice.volume = smp.volume as i32 * 4;
                voice.position = 0;
                return;
            }

            voice.autovib_depth = 0;
            voice.autovib_position = 0;
            voice.adopt_sample_loops(smp);

            voice.sample = Some(slot);
            voice.length = smp.length;
            voice.loop_start = smp.loop_start;
            voice.loop_end = smp.loop_end;
            voice.c5_speed = smp.c5_speed;
            voice.position = 0;
            voice.position_frac = 0;

            if voice.sustain_engaged && (!porta || (penv.is_some() && !was_key_off)) {
                voice.loop_start = smp.sustain_start;
                voice.loop_end = smp.sustain_end;
                voice.loop_kind = voice.sustain_kind;
            }
            if voice.loop_kind.is_loop() && voice.loop_end < voice.length {
                voice.length = voice.loop_end;
            }
        }
    }

    /// Trigger (or portamento-retarget) a note on a channel voice.
    pub(crate) fn note_change(&mut self, idx: usize, note: u8, porta: bool, retrig: bool, have_inst: bool) {
        if note == NOTE_NONE {
            return;
        }
        let instrument_mode = self.song.instrument_mode();
        let linear = self.song.linear_slides();
        let old_effects = self.song.old_effects();
        let compat_gxx = self.song.compat_gxx();

        // The note actually keyed, before keyboard transposition; pitch-pan
        // and duplicate checks want this one.
        let truenote = note;
        let mut note = note;
        let mut sample_slot = self.voices[idx].sample;
        let penv_slot = if instrument_mode {
            self.voices[idx].instrument
        } else {
            None
        };

        if let Some(ins) = penv_slot.and_then(|p| self.song.instrument(p)) {
            if note_is_note(note) {
                let entry = ins.keyboard[(note - 1) as usize];
                if entry.sample == 0 {
                    return;
                }
                if !(have_inst && porta && sample_slot.is_some()) {
                    if self.song.sample(entry.sample).is_some() {
                        sample_slot = Some(entry.sample);
                    }
                }
                if entry.note != 0 {
                    note = entry.note;
                }
            }
        }

        if note_is_control(note) {
            // Park a control value so stray instrument numbers cannot
            // retrigger the dead note.
            {
                let voice = &mut self.voices[idx];
                voice.note = NOTE_OFF;
                voice.new_note = NOTE_OFF;
            }
            match note {
                NOTE_OFF => {
                    self.key_off(idx);
                    if !porta && old_effects && self.voices[idx].row_instr != 0 {
                        let voice = &mut self.voices[idx];
                        voice.note_fade = false;
                        voice.key_off = false;
                    }
                }
                NOTE_CUT => self.note_cut(idx, true),
                // Everything else (including NOTE_FADE) fades.
                _ => {
                    if instrument_mode {
                        self.voices[idx].note_fade = true;
                    }
                }
            }
            return;
        }

        let Some(slot) = sample_slot else { return };
        let Some(smp_c5) = self.song.sample(slot).map(|s| s.c5_speed) else {
            return;
        };

        if !porta {
            self.voices[idx].c5_speed = smp_c5;
        }
        let porta = porta && self.voices[idx].increment != 0;

        note = note.clamp(NOTE_FIRST, NOTE_LAST);
        {
            let voice = &mut self.voices[idx];
            voice.note = truenote.clamp(NOTE_FIRST, NOTE_LAST);
            voice.new_instrument = 0;
            voice.panbrello_delta = 0;
        }

        let c5_speed = self.voices[idx].c5_speed;
        let period = period_from_note(note, c5_speed, linear);
        let mut porta = porta;

        if period != 0 {
            {
                let song = &self.song;
                let voice = &mut self.voices[idx];
                if porta && voice.period != 0 {
                    voice.portamento_target = period;
                } else {
                    voice.portamento_target = 0;
                    voice.period = period;
                }
                if !porta || voice.length == 0 {
                    if let Some(smp) = song.sample(slot) {
                        voice.sample = Some(slot);
                        voice.length = smp.length;
                        voice.loop_end = smp.length;
                        voice.loop_start = 0;
                        voice.adopt_sample_loops(smp);
                        if voice.sustain_engaged {
                            voice.loop_start = smp.sustain_start;
                            voice.loop_end = smp.sustain_end;
                            voice.loop_kind = voice.sustain_kind;
                            voice.reverse = false;
                            if voice.length > voice.loop_end {
                                voice.length = voice.loop_end;
                            }
                        } else if voice.loop_kind.is_loop() {
                            voice.loop_start = smp.loop_start;
                            voice.loop_end = smp.loop_end;
                            if voice.length > voice.loop_end {
                                voice.length = voice.loop_end;
                            }
                        }
                    }
                    voice.position = 0;
                    voice.position_frac = 0;
                }
                if voice.position >= voice.length as i32 {
                    voice.position = voice.loop_start as i32;
                }
            }
        } else {
            porta = false;
        }

        // Instrument/sample default panning.
        {
            let song = &self.song;
            let ins_pan = penv_slot
                .and_then(|p| song.instrument(p))
                .and_then(|i| i.default_pan);
            let smp_pan = song.sample(slot).and_then(|s| s.default_pan);
            let voice = &mut self.voices[idx];
            if let Some(pan) = ins_pan {
                set_instrument_panning(voice, pan as i32);
            } else if let Some(pan) = smp_pan {
                set_instrument_panning(voice, pan as i32 * 4);
            }
        }

        // Immediate pitch-pan separation.
        if let Some(ins) = penv_slot.and_then(|p| self.song.instrument(p)) {
            if ins.pitch_pan_separation != 0 {
                let voice = &mut self.voices[idx];
                if voice.saved_pan.is_none() {
                    voice.saved_pan = Some((voice.panning as u16 + 1, voice.surround));
                }
                let delta = (voice.note as i32 - ins.pitch_pan_center as i32 - 1)
                    * ins.pitch_pan_separation as i32
                    / 2;
                voice.panning = (voice.panning + delta).clamp(0, 256);
            }
        }

        if !porta {
            let song = &self.song;
            let ins = penv_slot.and_then(|p| song.instrument(p));
            let voice = &mut self.voices[idx];
            if let Some(ins) = ins {
                voice.nna = ins.nna;
            }
            env_reset(voice, ins, false);
        }

        if porta && compat_gxx && self.voices[idx].row_instr != 0 {
            self.voices[idx].key_off = false;
        }

        if !porta {
            let ins_filter = penv_slot
                .and_then(|p| self.song.instrument(p))
                .map(|i| (i.filter_cutoff, i.filter_resonance));
            let voice = &mut self.voices[idx];
            voice.vu_meter = 0;
            voice.filter_on = false;
            voice.fast_ramp = true;
            voice.fresh_note = true;
            if !retrig {
                voice.autovib_depth = 0;
                voice.autovib_position = 0;
                voice.vibrato_position = 0;
            }
            voice.left_volume = 0;
            voice.right_volume = 0;
            match ins_filter {
                Some((cutoff, resonance)) => {
                    if let Some(r) = resonance {
                        voice.resonance = r;
                    }
                    if let Some(c) = cutoff {
                        voice.cutoff = c;
                    }
                }
                None => {
                    voice.vol_swing = 0;
                    voice.pan_swing = 0;
                }
            }
            self.emit_midi_on(idx);
        }
    }

    /// Qxy retrigger countdown.
    fn retrig_note(&mut self, idx: usize, param: u8) {
        let first_tick = self.first_tick;
        {
            let voice = &mut self.voices[idx];
            if first_tick && voice.row_note != NOTE_NONE {
                voice.cd_retrig = (param & 0x0F) as i32;
                return;
            }
            voice.cd_retrig -= 1;
            if voice.cd_retrig > 0 {
                return;
            }
            // Retriggering only works while a sample is actually playing.
            if voice.position == 0 {
                return;
            }
            voice.cd_retrig = (param & 0x0F) as i32;
        }

        let vol_mod = (param >> 4) as usize;
        if vol_mod != 0 {
            let voice = &mut self.voices[idx];
            let mut vol = voice.volume;
            if RETRIG_MUL[vol_mod] != 0 {
                vol = (vol * RETRIG_MUL[vol_mod] as i32) >> 4;
            } else {
                vol += (RETRIG_ADD[vol_mod] as i32) << 2;
            }
            voice.volume = vol.clamp(0, 256);
            voice.fast_ramp = true;
        }

        let note = self.voices[idx].new_note;
        let period = self.voices[idx].period;
        if note_is_note(note) && self.voices[idx].length != 0 {
            self.check_nna(idx, 0, note, true);
        }
        self.note_change(idx, note, true, true, false);
        let voice = &mut self.voices[idx];
        if period != 0 && voice.row_note == NOTE_NONE {
            voice.period = period;
        }
        voice.position = 0;
        voice.position_frac = 0;
    }

    /// SBx pattern loop: remembers a start row per channel, then rewinds
    /// the row pointer until the count runs out.
    fn pattern_loop(&mut self, idx: usize, param: u8) {
        let row = self.row;
        let voice = &mut self.voices[idx];
        if param != 0 {
            if voice.cd_pattern_loop != 0 {
                voice.cd_pattern_loop -= 1;
                if voice.cd_pattern_loop == 0 {
                    // Loop done; next SBx with the same start must not
                    // re-enter this one.
                    voice.pattern_loop_row = row + 1;
                    self.pattern_loop_active = false;
                    return;
                }
            } else {
                voice.cd_pattern_loop = param;
            }
            self.process_row = voice.pattern_loop_row.wrapping_sub(1);
        } else {
            self.pattern_loop_active = true;
            voice.pattern_loop_row = row;
        }
    }

    /// Sxy extended commands.
    fn special(&mut self, idx: usize, param: u8) {
        let song_first = self.first_tick;
        let command = param & 0xF0;
        let param = param & 0x0F;
        match command {
            // S1x: glissando control
            0x10 => self.voices[idx].glissando = param != 0,
            // S3x: vibrato waveform
            0x30 => self.voices[idx].vibrato_type = Waveform::from_u8(param),
            // S4x: tremolo waveform
            0x40 => self.voices[idx].tremolo_type = Waveform::from_u8(param),
            // S5x: panbrello waveform
            0x50 => {
                let voice = &mut self.voices[idx];
                voice.panbrello_type = if param < 4 {
                    Waveform::from_u8(param)
                } else {
                    Waveform::Sine
                };
                voice.panbrello_position = 0;
            }
            // S6x: extend this row by x ticks
            0x60 => {
                if song_first {
                    self.frame_delay += param as u32;
                    self.tick_count += param as u32;
                }
            }
            // S7x: past-note and envelope control
            0x70 => {
                if !song_first {
                    return;
                }
                match param {
                    0 | 1 | 2 => {
                        for i in MAX_CHANNELS..MAX_VOICES {
                            if self.voices[i].master_channel == idx as u32 + 1 {
                                match param {
                                    1 => self.key_off(i),
                                    2 => self.voices[i].note_fade = true,
                                    _ => {
                                        let v = &mut self.voices[i];
                                        v.note_fade = true;
                                        v.fadeout_volume = 0;
                                    }
                                }
                            }
                        }
                    }
                    3 => self.voices[idx].nna = NewNoteAction::Cut,
                    4 => self.voices[idx].nna = NewNoteAction::Continue,
                    5 => self.voices[idx].nna = NewNoteAction::NoteOff,
                    6 => self.voices[idx].nna = NewNoteAction::NoteFade,
                    7 => self.voices[idx].vol_env_on = false,
                    8 => self.voices[idx].vol_env_on = true,
                    9 => self.voices[idx].pan_env_on = false,
                    10 => self.voices[idx].pan_env_on = true,
                    11 => self.voices[idx].pitch_env_on = false,
                    12 => self.voices[idx].pitch_env_on = true,
                    _ => {}
                }
            }
            // S8x: coarse panning
            0x80 => {
                if song_first {
                    let voice = &mut self.voices[idx];
                    voice.surround = false;
                    voice.panbrello_delta = 0;
                    voice.panning = ((param as i32) << 4) + 8;
                    voice.saved_pan = None;
                    voice.fast_ramp = true;
                    voice.pan_swing = 0;
                }
            }
            // S91: surround
            0x90 => {
                if param == 1 && song_first {
                    let voice = &mut self.voices[idx];
                    voice.surround = true;
                    voice.panbrello_delta = 0;
                    voice.panning = 128;
                    voice.saved_pan = None;
                }
            }
            // SAx: high offset (applied by the next Oxx, never directly)
            0xA0 => {
                if song_first {
                    let voice = &mut self.voices[idx];
                    voice.mem_offset =
                        ((param as u32) << 16) | (voice.mem_offset & !0xF_0000);
                }
            }
            // SBx: pattern loop
            0xB0 => {
                if song_first {
                    self.pattern_loop(idx, param);
                }
            }
            // SCx: note cut after x ticks
            0xC0 => {
                if song_first {
                    self.voices[idx].cd_note_cut = if param != 0 { param } else { 1 };
                } else {
                    let v = &mut self.voices[idx];
                    if v.cd_note_cut > 0 {
                        v.cd_note_cut -= 1;
                        if v.cd_note_cut == 0 {
                            self.note_cut(idx, true);
                        }
                    }
                }
            }
            // SDx: note delay, handled up in process_effects
            // SEx: pattern delay for x rows
            0xE0 => {
                if song_first && self.row_count == 0 {
                    self.row_count = param as i32 + 1;
                }
            }
            _ => {}
        }
    }

    /// Ixy tremor: duty-cycle countdown shared between rows.
    fn tremor(&mut self, idx: usize, param: u8) {
        let song_first = self.first_tick;
        let old_effects = self.song.old_effects();
        let voice = &mut self.voices[idx];

        if song_first {
            let mut param = param;
            if param == 0 {
                param = voice.mem_tremor;
            } else if !old_effects {
                if param & 0xF0 != 0 {
                    param -= 0x10;
                }
                if param & 0x0F != 0 {
                    param -= 0x01;
                }
            }
            voice.mem_tremor = param;
            voice.cd_tremor |= 128;
        }

        if voice.cd_tremor & 128 != 0 && voice.length != 0 {
            if voice.cd_tremor == 128 {
                voice.cd_tremor = (voice.mem_tremor >> 4) | 192;
            } else if voice.cd_tremor == 192 {
                voice.cd_tremor = (voice.mem_tremor & 0x0F) | 128;
            } else {
                voice.cd_tremor -= 1;
            }
        }

        voice.active_fx = ContinuedFx::Tremor;
    }

    fn global_volume_slide(&mut self, idx: usize, param: u8) {
        let first_tick = self.first_tick;
        let param = {
            let voice = &mut self.voices[idx];
            if param != 0 {
                voice.mem_global_volslide = param;
                param as i32
            } else {
                voice.mem_global_volslide as i32
            }
        };

        let mut slide = 0;
        if (param & 0x0F) == 0x0F && (param & 0xF0) != 0 {
            if first_tick {
                slide = param >> 4;
            }
        } else if (param & 0xF0) == 0xF0 && (param & 0x0F) != 0 {
            if first_tick {
                slide = -(param & 0x0F);
            }
        } else if !first_tick {
            if param & 0xF0 != 0 {
                slide = (param & 0xF0) >> 4;
            } else {
                slide = -(param & 0x0F);
            }
        }
        if slide != 0 {
            self.current_global_volume =
                (self.current_global_volume as i32 + slide).clamp(0, 128) as u32;
        }
    }

    /// Effect-column dispatch for one channel and one tick.
    fn handle_effect(&mut self, idx: usize, cmd: Command, firsttick: bool) {
        let song_first = self.first_tick;
        let eff_first = song_first || firsttick;
        let linear = self.song.linear_slides();
        let old_effects = self.song.old_effects();

        match cmd {
            Command::None => {}

            Command::SetSpeed(param) => {
                if song_first && param != 0 {
                    self.tick_count = param as u32;
                    self.current_speed = param as u32;
                }
            }

            Command::Tempo(param) => {
                if song_first {
                    let param = if param != 0 {
                        self.voices[idx].mem_tempo = param;
                        param
                    } else {
                        self.voices[idx].mem_tempo
                    };
                    if param >= 0x20 {
                        self.current_tempo = param as u32;
                    }
                } else {
                    let param = self.voices[idx].mem_tempo;
                    match param >> 4 {
                        0 => {
                            self.current_tempo =
                                self.current_tempo.saturating_sub((param & 0x0F) as u32).max(32);
                        }
                        1 => {
                            self.current_tempo =
                                (self.current_tempo + (param & 0x0F) as u32).min(255);
                        }
                        _ => {}
                    }
                }
            }

            Command::PositionJump(param) => {
                self.process_order = param as i32 - 1;
                self.process_row = PROCESS_NEXT_ORDER;
            }

            Command::PatternBreak(param) => {
                if !self.pattern_loop_active {
                    self.break_row = param as u32;
                    self.process_row = PROCESS_NEXT_ORDER;
                }
            }

            Command::VolumeSlide(param) => {
                fx_volume_slide(&mut self.voices[idx], eff_first, param);
            }

            Command::PortamentoUp(_) => {
                let mem = self.voices[idx].mem_pitchslide;
                fx_portamento_up(&mut self.voices[idx], linear, eff_first, mem);
            }

            Command::PortamentoDown(_) => {
                let mem = self.voices[idx].mem_pitchslide;
                fx_portamento_down(&mut self.voices[idx], linear, eff_first, mem);
            }

            Command::TonePortamento(_) => {
                let mem = self.voices[idx].mem_portanote;
                fx_tone_portamento(&mut self.voices[idx], linear, eff_first, mem);
            }

            Command::TonePortaVolSlide(param) => {
                let mem = self.voices[idx].mem_portanote;
                fx_tone_portamento(&mut self.voices[idx], linear, eff_first, mem);
                fx_volume_slide(&mut self.voices[idx], eff_first, param);
            }

            Command::Vibrato(param) => fx_vibrato(&mut self.voices[idx], param),

            Command::FineVibrato(param) => fx_fine_vibrato(&mut self.voices[idx], param),

            Command::VibratoVolSlide(param) => {
                fx_volume_slide(&mut self.voices[idx], eff_first, param);
                fx_vibrato(&mut self.voices[idx], 0);
            }

            Command::SampleOffset(param) => {
                if !song_first {
                    return;
                }
                let voice = &mut self.voices[idx];
                if param != 0 {
                    voice.mem_offset =
                        (voice.mem_offset & !0xFF00) | ((param as u32) << 8);
                }
                let trigger = if voice.row_instr != 0 {
                    voice.new_note
                } else {
                    voice.row_note
                };
                if note_is_note(trigger) {
                    voice.position = voice.mem_offset as i32;
                    if voice.position > voice.length as i32 {
                        voice.position = if old_effects { voice.length as i32 } else { 0 };
                    }
                }
            }

            Command::Arpeggio(param) => {
                self.voices[idx].active_fx = ContinuedFx::Arpeggio;
                if song_first && param != 0 {
                    self.voices[idx].mem_arpeggio = param;
                }
            }

            Command::Retrigger(param) => {
                if param != 0 {
                    self.voices[idx].mem_retrig = param;
                }
                let mem = self.voices[idx].mem_retrig;
                self.retrig_note(idx, mem);
            }

            Command::Tremor(param) => self.tremor(idx, param),

            Command::GlobalVolume(param) => {
                if firsttick && param <= 128 {
                    self.current_global_volume = param as u32;
                }
            }

            Command::GlobalVolSlide(param) => self.global_volume_slide(idx, param),

            Command::SetPanning(param) => {
                if !song_first {
                    return;
                }
                let voice = &mut self.voices[idx];
                voice.surround = false;
                voice.panbrello_delta = 0;
                voice.panning = param as i32;
                voice.saved_pan = None;
                voice.pan_swing = 0;
                voice.fast_ramp = true;
            }

            Command::PanningSlide(param) => {
                fx_panning_slide(&mut self.voices[idx], eff_first, param);
            }

            Command::Tremolo(param) => {
                fx_tremolo(&mut self.voices[idx], &mut self.prng, eff_first, old_effects, param);
            }

            Command::Special(param) => {
                // Memory and the SDx special case were already handled in
                // process_effects; everything else dispatches here.
                let param = if param != 0 {
                    param
                } else {
                    self.voices[idx].mem_special
                };
                if param >> 4 != 0xD {
                    self.special(idx, param);
                }
            }

            Command::ChannelVolume(param) => {
                if song_first && param <= 64 {
                    let voice = &mut self.voices[idx];
                    voice.channel_volume = param as i32;
                    voice.fast_ramp = true;
                }
            }

            Command::ChannelVolSlide(param) => {
                fx_channel_vol_slide(&mut self.voices[idx], eff_first, param);
            }

            Command::Panbrello(param) => {
                fx_panbrello(&mut self.voices[idx], &mut self.prng, param);
            }
        }
    }

    /// Volume-column dispatch. Volume and panning land on the note's start
    /// tick (which SDx can move); slides run like effect-column slides.
    fn handle_voleffect(
        &mut self,
        idx: usize,
        volcmd: VolumeCommand,
        firsttick: bool,
        start_note: bool,
    ) {
        let eff_first = self.first_tick || firsttick;
        let linear = self.song.linear_slides();

        match volcmd {
            VolumeCommand::None => {}

            VolumeCommand::Volume(vol) => {
                if start_note {
                    let voice = &mut self.voices[idx];
                    voice.volume = (vol.min(64) as i32) << 2;
                    voice.fast_ramp = true;
                }
            }

            VolumeCommand::Panning(vol) => {
                if start_note {
                    let voice = &mut self.voices[idx];
                    voice.panning = (vol.min(64) as i32) << 2;
                    voice.saved_pan = None;
                    voice.pan_swing = 0;
                    voice.panbrello_delta = 0;
                    voice.fast_ramp = true;
                    voice.surround = false;
                }
            }

            VolumeCommand::PortamentoUp(_) => {
                if !start_note {
                    let mem = self.voices[idx].mem_pitchslide;
                    fx_reg_portamento_up(&mut self.voices[idx], linear, eff_first, mem);
                }
            }

            VolumeCommand::PortamentoDown(_) => {
                if !start_note {
                    let mem = self.voices[idx].mem_pitchslide;
                    fx_reg_portamento_down(&mut self.voices[idx], linear, eff_first, mem);
                }
            }

            VolumeCommand::TonePortamento(_) => {
                if !start_note {
                    let mem = self.voices[idx].mem_portanote;
                    fx_tone_portamento(&mut self.voices[idx], linear, eff_first, mem);
                }
            }

            VolumeCommand::VolSlideUp(vol) => {
                let voice = &mut self.voices[idx];
                if start_note {
                    if vol != 0 {
                        voice.mem_vc_volslide = vol;
                    }
                } else {
                    fx_volume_up(voice, voice.mem_vc_volslide as u32);
                }
            }

            VolumeCommand::VolSlideDown(vol) => {
                let voice = &mut self.voices[idx];
                if start_note {
                    if vol != 0 {
                        voice.mem_vc_volslide = vol;
                    }
                } else {
                    fx_volume_down(voice, voice.mem_vc_volslide as u32);
                }
            }

            VolumeCommand::FineVolUp(vol) => {
                if start_note {
                    let voice = &mut self.voices[idx];
                    let vol = if vol != 0 {
                        voice.mem_vc_volslide = vol;
                        vol
                    } else {
                        voice.mem_vc_volslide
                    };
                    fx_volume_up(voice, vol as u32);
                }
            }

            VolumeCommand::FineVolDown(vol) => {
                if start_note {
                    let voice = &mut self.voices[idx];
                    let vol = if vol != 0 {
                        voice.mem_vc_volslide = vol;
                        vol
                    } else {
                        voice.mem_vc_volslide
                    };
                    fx_volume_down(voice, vol as u32);
                }
            }

            VolumeCommand::VibratoDepth(vol) => fx_vibrato(&mut self.voices[idx], vol),
        }
    }

    /// Run effect processing for every channel on this tick. `firsttick`
    /// distinguishes a fresh row latch from pattern-delay relatches; the
    /// song's first-tick flag tracks real row boundaries.
    pub(crate) fn process_effects(&mut self, firsttick: bool) {
        let instrument_mode = self.song.instrument_mode();
        let compat_gxx = self.song.compat_gxx();
        let old_effects = self.song.old_effects();

        for idx in 0..MAX_CHANNELS {
            self.voices[idx].active_fx = ContinuedFx::None;

            let mut instr = self.voices[idx].row_instr;
            let volcmd = self.voices[idx].row_volcmd;
            let cmd = self.voices[idx].row_command;
            let porta = cmd.is_tone_portamento() || volcmd.is_tone_portamento();
            let mut start_note = self.first_tick;

            {
                let voice = &mut self.voices[idx];
                voice.fast_ramp = false;
                voice.fresh_note = false;
                if instr != 0 && start_note {
                    voice.new_instrument = instr;
                }
            }

            // An instrument-mode cell whose note maps to no sample swallows
            // the entire cell, global effects included, and keeps doing so
            // for bare instrument numbers on later rows.
            if instrument_mode && instr > 0 {
                if let Some(ins) = self.song.instrument(instr) {
                    let voice = &mut self.voices[idx];
                    let note = if voice.row_note != NOTE_NONE {
                        voice.row_note
                    } else {
                        voice.new_note
                    };
                    if note_is_note(note) && ins.keyboard[(note - 1) as usize].sample == 0 {
                        voice.new_note = note;
                        voice.row_instr = 0;
                        voice.row_volcmd = VolumeCommand::None;
                        voice.row_command = Command::None;
                        continue;
                    }
                }
            }

            // SDx note delay gates everything below it.
            if let Command::Special(param) = cmd {
                let param = {
                    let voice = &mut self.voices[idx];
                    if param != 0 {
                        voice.mem_special = param;
                        param
                    } else {
                        voice.mem_special
                    }
                };
                if param >> 4 == 0xD {
                    if firsttick {
                        let voice = &mut self.voices[idx];
                        voice.cd_note_delay =
                            if param & 0x0F != 0 { param & 0x0F } else { 1 };
                        continue; // notes never play on the first tick of SDx
                    }
                    let voice = &mut self.voices[idx];
                    voice.cd_note_delay = voice.cd_note_delay.saturating_sub(1);
                    if voice.cd_note_delay > 0 {
                        continue; // not our turn yet
                    }
                    start_note = voice.cd_note_delay == 0;
                }
            }

            // Note/instrument/volume changes on the start tick.
            if start_note {
                let mut note = self.voices[idx].row_note;

                // A dangling instrument reference silences the cell's note.
                if instrument_mode && (note_is_note(note) || note == NOTE_NONE) {
                    let check = if instr != 0 {
                        instr
                    } else {
                        self.voices[idx].last_instrument
                    };
                    if check != 0
                        && (check as usize >= cinder_song::MAX_INSTRUMENTS
                            || self.song.instrument(check).is_none())
                    {
                        note = NOTE_NONE;
                        instr = 0;
                    }
                }

                // Bare instrument number after key-off in the legacy modes
                // restarts the envelopes.
                if instrument_mode && instr != 0 && !note_is_note(note) {
                    if (porta && compat_gxx) || (!porta && old_effects) {
                        let song = &self.song;
                        let slot = self.voices[idx].instrument;
                        let ins = slot.and_then(|p| song.instrument(p));
                        env_reset(&mut self.voices[idx], ins, true);
                        self.voices[idx].fadeout_volume = 65536;
                    }
                }

                // Bare instrument number: reset volume, maybe retrigger the
                // previous note.
                if instr != 0 && note == NOTE_NONE {
                    {
                        let song = &self.song;
                        let voice = &mut self.voices[idx];
                        if instrument_mode {
                            if let Some(smp) = voice.sample.and_then(|s| song.sample(s)) {
                                voice.volume = smp.volume as i32 * 4;
                            }
                        } else if let Some(smp) = song.sample(instr) {
                            voice.volume = smp.volume as i32 * 4;
                        }
                    }
                    let retrigger = if instrument_mode {
                        self.voices[idx].instrument != Some(instr)
                            || self.voices[idx].length == 0
                    } else {
                        self.voices[idx].sample != Some(instr)
                            || self.voices[idx].length == 0
                    };
                    if retrigger {
                        note = self.voices[idx].note;
                    }
                }

                if instr as usize >= cinder_song::MAX_INSTRUMENTS {
                    instr = 0;
                }

                if note_is_control(note) {
                    if instr != 0 {
                        let smp = if instrument_mode {
                            self.song.instrument(instr).map(|ins| {
                                let n = self.voices[idx].note;
                                if note_is_note(n) {
                                    ins.keyboard[(n - 1) as usize].sample
                                } else {
                                    0
                                }
                            })
                        } else {
                            Some(instr)
                        };
                        if let Some(smp) = smp.filter(|&s| s != 0) {
                            if let Some(smp) = self.song.sample(smp) {
                                self.voices[idx].volume = smp.volume as i32 * 4;
                            }
                        }
                    }
                    if !old_effects {
                        instr = 0;
                    }
                }

                let previous_new_note = self.voices[idx].new_note;
                if note_is_note(note) {
                    self.voices[idx].new_note = note;

                    if !porta {
                        self.check_nna(idx, instr, note, false);
                    }

                    // Restore the channel pan an instrument default stole.
                    if let Some((pan, surround)) = self.voices[idx].saved_pan.take() {
                        let voice = &mut self.voices[idx];
                        voice.panning = pan as i32 - 1;
                        voice.surround = surround;
                    }
                }

                if instr != 0 {
                    let old_sample = self.voices[idx].sample;
                    self.instrument_change(idx, instr, porta, true);
                    if note_is_note(note) {
                        self.voices[idx].new_instrument = 0;
                        if self.voices[idx].sample != old_sample {
                            self.voices[idx].position = 0;
                            self.voices[idx].position_frac = 0;
                        }
                    }
                }

                if note != NOTE_NONE {
                    if instr == 0
                        && self.voices[idx].new_instrument != 0
                        && note_is_note(note)
                    {
                        // A queued instrument from a previous bare number
                        // kicks in with this note.
                        if note_is_note(previous_new_note) {
                            self.voices[idx].new_note = previous_new_note;
                        }
                        let queued = self.voices[idx].new_instrument;
                        self.instrument_change(idx, queued, porta, false);
                        self.voices[idx].new_note = note;
                        self.voices[idx].new_instrument = 0;
                    }
                    self.note_change(idx, note, porta, false, instr == 0);
                }
            }

            // Portamento memory priming, in exactly this order.
            if firsttick {
                let voice = &mut self.voices[idx];
                let effect_column_tone_porta = cmd.is_tone_portamento();
                if effect_column_tone_porta {
                    let toneporta_param = match cmd {
                        Command::TonePortamento(p) => p,
                        _ => 0, // Lxy reuses memory
                    };
                    if toneporta_param != 0 {
                        voice.mem_portanote = toneporta_param;
                    } else if !compat_gxx {
                        voice.mem_portanote = voice.mem_pitchslide;
                    }
                    if !compat_gxx {
                        voice.mem_pitchslide = voice.mem_portanote;
                    }
                }
                if let VolumeCommand::TonePortamento(vol) = volcmd {
                    if vol != 0 {
                        voice.mem_portanote = VC_PORTAMENTO[(vol & 0x0F) as usize];
                    }
                    if !compat_gxx {
                        voice.mem_pitchslide = voice.mem_portanote;
                    }
                }
                match volcmd {
                    VolumeCommand::PortamentoUp(v) | VolumeCommand::PortamentoDown(v)
                        if v != 0 =>
                    {
                        voice.mem_pitchslide = 4 * v;
                        if !effect_column_tone_porta && !compat_gxx {
                            voice.mem_portanote = voice.mem_pitchslide;
                        }
                    }
                    _ => {}
                }
                match cmd {
                    Command::PortamentoUp(p) | Command::PortamentoDown(p) if p != 0 => {
                        voice.mem_pitchslide = p;
                        if !compat_gxx {
                            voice.mem_portanote = voice.mem_pitchslide;
                        }
                    }
                    _ => {}
                }
            }

            self.handle_voleffect(idx, volcmd, firsttick, start_note);
            self.handle_effect(idx, cmd, firsttick);
        }
    }

    // === MIDI callouts ===

    /// Queue a note-on for instruments with MIDI routing. Velocity uses the
    /// linear `volume x instrument volume` scaling.
    fn emit_midi_on(&mut self, idx: usize) {
        let voice = &self.voices[idx];
        let Some(ins) = voice.instrument.and_then(|i| self.song.instrument(i)) else {
            return;
        };
        if ins.midi_channel_mask == 0 {
            return;
        }
        let velocity =
            ((voice.volume * voice.instrument_volume) / 128).clamp(1, 127) as u8;
        let event = MidiEvent::note_on(
            self.frames_rendered,
            ins.midi_channel_mask.trailing_zeros() as u8 & 0x0F,
            voice.note,
            velocity,
        );
        self.queue_midi(event);
    }

    /// Queue a note-off when a routed voice is released or cut.
    fn emit_midi_off(&mut self, idx: usize) {
        let voice = &self.voices[idx];
        if voice.key_off {
            return; // already released
        }
        let Some(ins) = voice.instrument.and_then(|i| self.song.instrument(i)) else {
            return;
        };
        if ins.midi_channel_mask == 0 || !note_is_note(voice.note) {
            return;
        }
        let event = MidiEvent::note_off(
            self.frames_rendered,
            ins.midi_channel_mask.trailing_zeros() as u8 & 0x0F,
            voice.note,
        );
        self.queue_midi(event);
    }

    fn queue_midi(&mut self, event: MidiEvent) {
        // Bounded queue; drop instead of allocating in the render path.
        if self.midi_queue.len() < self.midi_queue.capacity() {
            self.midi_queue.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_slide_orders() {
        let mut v = Voice {
            volume: 128,
            ..Default::default()
        };
        // D04: slides down on non-first ticks only.
        fx_volume_slide(&mut v, true, 0x04);
        assert_eq!(v.volume, 128);
        fx_volume_slide(&mut v, false, 0x04);
        assert_eq!(v.volume, 112);
        // D0F acts immediately (S3M compatibility).
        fx_volume_slide(&mut v, true, 0x0F);
        assert_eq!(v.volume, 52);
        // D2F: fine slide up on the first tick only.
        fx_volume_slide(&mut v, true, 0x2F);
        assert_eq!(v.volume, 60);
        fx_volume_slide(&mut v, false, 0x2F);
        assert_eq!(v.volume, 60);
        // Zero param reuses memory (still 2F).
        fx_volume_slide(&mut v, true, 0x00);
        assert_eq!(v.volume, 68);
    }

    #[test]
    fn volume_slide_clamps() {
        let mut v = Voice {
            volume: 250,
            ..Default::default()
        };
        fx_volume_slide(&mut v, false, 0xF0);
        assert_eq!(v.volume, 256);
        v.volume = 6;
        fx_volume_slide(&mut v, false, 0x0F);
        assert_eq!(v.volume, 0);
    }

    #[test]
    fn tone_portamento_never_overshoots() {
        let mut v = Voice {
            period: 1712,
            portamento_target: 856,
            ..Default::default()
        };
        for _ in 0..1000 {
            fx_tone_portamento(&mut v, true, false, 0x10);
            assert!(v.period >= 856);
            if v.portamento_target == 0 {
                break;
            }
        }
        assert_eq!(v.period, 856, "portamento lands exactly on the target");
        assert_eq!(v.portamento_target, 0);
    }

    #[test]
    fn tone_portamento_moves_at_least_one_unit() {
        // A tiny period with a slow linear slide must still converge.
        let mut v = Voice {
            period: 100,
            portamento_target: 98,
            ..Default::default()
        };
        fx_tone_portamento(&mut v, true, false, 0x01);
        assert!(v.period < 100);
    }

    #[test]
    fn vibrato_params_nibble_split() {
        let mut v = Voice::default();
        fx_vibrato(&mut v, 0x84);
        assert_eq!(v.vibrato_speed, 8);
        assert_eq!(v.vibrato_depth, 16);
        assert!(v.vibrato_on);

        let mut f = Voice::default();
        fx_fine_vibrato(&mut f, 0x84);
        assert_eq!(f.vibrato_depth, 4, "fine vibrato is quarter depth");
    }

    #[test]
    fn channel_volume_slide_clamps_to_64() {
        let mut v = Voice {
            channel_volume: 60,
            ..Default::default()
        };
        fx_channel_vol_slide(&mut v, true, 0x8F); // fine up 8
        assert_eq!(v.channel_volume, 64);
        fx_channel_vol_slide(&mut v, true, 0xF8); // fine down 8
        assert_eq!(v.channel_volume, 56);
    }

    #[test]
    fn instrument_panning_saves_old_pan() {
        let mut v = Voice {
            panning: 64,
            surround: true,
            ..Default::default()
        };
        set_instrument_panning(&mut v, 200);
        assert_eq!(v.panning, 200);
        assert!(!v.surround);
        assert_eq!(v.saved_pan, Some((65, true)));
    }
}
