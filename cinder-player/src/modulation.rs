//! The per-tick modulation pipeline.
//!
//! [`Player::update_voices`] runs once per tick over every voice and turns
//! song state into mixing parameters: 14-bit final volume, final panning,
//! and the 16.16 resample increment. The order of operations (tremolo before
//! clamping, envelopes on the 14-bit value, glissando before arpeggio before
//! pitch envelope before vibrato) is fixed; songs rely on it.

use cinder_song::{Envelope, Instrument, Sample, SongFlags, MAX_CHANNELS};

use crate::pitch::{freq_from_period, note_from_period, period_from_note, period_transpose};
use crate::player::{Player, Prng};
use crate::tables::{
    waveform_value, FINE_LINEAR_SLIDE_DOWN, FINE_LINEAR_SLIDE_UP, LINEAR_SLIDE_DOWN,
    LINEAR_SLIDE_UP,
};
use crate::voice::{ContinuedFx, Voice};
use crate::{muldiv, MAX_VOICES};

/// Linearly interpolated envelope value at `position` ticks.
///
/// Returns the raw node scale (0-64); the caller shifts it into whatever
/// fixed-point range it needs. Exact at node ticks: when `position` sits on
/// a node, the division contributes nothing and the node value is returned
/// untouched.
pub(crate) fn envelope_value(env: &Envelope, position: i32) -> i32 {
    let nodes = &env.nodes;
    if nodes.is_empty() {
        return 0;
    }
    let mut pt = nodes.len() - 1;
    for (i, node) in nodes.iter().enumerate().take(nodes.len() - 1) {
        if position <= node.tick as i32 {
            pt = i;
            break;
        }
    }

    let x2 = nodes[pt].tick as i32;
    let y2 = nodes[pt].value as i32;
    let (mut value, x1);

    if position >= x2 {
        value = y2;
        x1 = x2;
    } else if pt > 0 {
        value = nodes[pt - 1].value as i32;
        x1 = nodes[pt - 1].tick as i32;
    } else {
        value = 0;
        x1 = 0;
    }

    let position = position.min(x2);
    if x2 > x1 && position > x1 {
        value += ((position - x1) * (y2 - value)) / (x2 - x1);
    }
    value
}

/// Volume envelope, panning envelope, fadeout, and pitch-pan separation.
/// `vol` is 14-bit in and out.
fn process_envelopes(voice: &mut Voice, ins: &Instrument, vol: &mut i32) {
    if voice.vol_env_on && !ins.volume_envelope.nodes.is_empty() {
        // Envelope values are 0-64; <<2 puts them on the 0-256 scale the
        // volume multiply expects.
        let envvol = (envelope_value(&ins.volume_envelope, voice.vol_env_position) << 2)
            .clamp(0, 256);
        *vol = (*vol * envvol) >> 8;
    }

    if voice.pan_env_on && !ins.panning_envelope.nodes.is_empty() {
        let envpan =
            envelope_value(&ins.panning_envelope, voice.pan_env_position).clamp(0, 64);
        // Blend toward the edge proportionally to the distance from center,
        // so a centered envelope leaves any pan position alone.
        let pan = voice.panning;
        voice.final_panning = if pan >= 128 {
            pan + ((envpan - 32) * (256 - pan)) / 32
        } else {
            pan + ((envpan - 32) * pan) / 32
        };
    }

    if voice.note_fade {
        let fadeout = ins.fadeout as i32;
        if fadeout != 0 {
            voice.fadeout_volume = (voice.fadeout_volume - (fadeout << 1)).max(0);
            *vol = (*vol * voice.fadeout_volume) >> 16;
        } else if voice.fadeout_volume == 0 {
            *vol = 0;
        }
    }

    if ins.pitch_pan_separation != 0 && voice.final_panning != 0 && voice.note != 0 {
        // One PPS unit pans 1/512 per semitone from the center note.
        voice.final_panning += (voice.note as i32 - ins.pitch_pan_center as i32 - 1)
            * ins.pitch_pan_separation as i32
            / 4;
    }
}

/// Pitch (or filter) envelope. Returns the envelope value scaled to ±256;
/// the period is bent only when the envelope is not a filter envelope.
fn pitch_filter_envelope(voice: &mut Voice, ins: &Instrument, period: &mut i32) -> i32 {
    let env = &ins.pitch_envelope;
    let envpitch = ((envelope_value(env, voice.pitch_env_position) - 32) * 8).clamp(-256, 256);

    if !env.is_filter() {
        let l = envpitch.unsigned_abs().min(255) as usize;
        let table = if envpitch < 0 {
            &LINEAR_SLIDE_UP
        } else {
            &LINEAR_SLIDE_DOWN
        };
        *period = muldiv(*period, table[l] as i32, 0x10000);
    }
    envpitch
}

/// Step the envelope cursors, handling loop wrap, sustain hold, and the end
/// clamp that flags note-fade.
fn advance_envelopes(voice: &mut Voice, ins: &Instrument) {
    if voice.vol_env_on {
        let env = &ins.volume_envelope;
        voice.vol_env_position += 1;

        if env.has_loop() {
            let loop_end_tick = env.node_tick(env.loop_end) as i32 + 1;
            if voice.vol_env_position == loop_end_tick {
                voice.vol_env_position = env.node_tick(env.loop_start) as i32;
                // A zero-length, zero-value loop means "stop here".
                if env.loop_end == env.loop_start && env.node_value(env.loop_start) == 0 {
                    voice.note_fade = true;
                    voice.fadeout_volume = 0;
                }
            }
        }

        if env.has_sustain()
            && voice.vol_env_position == env.node_tick(env.sustain_end) as i32 + 1
            && !voice.key_off
        {
            voice.vol_env_position = env.node_tick(env.sustain_start) as i32;
        } else if voice.vol_env_position > env.end_tick() as i32 {
            voice.vol_env_position = env.end_tick() as i32;
            voice.note_fade = true;
            if env.nodes.last().is_some_and(|n| n.value == 0) {
                voice.fadeout_volume = 0;
                voice.final_volume = 0;
            }
        }
    }

    if voice.pan_env_on {
        let env = &ins.panning_envelope;
        voice.pan_env_position += 1;

        if env.has_loop() && voice.pan_env_position == env.node_tick(env.loop_end) as i32 + 1 {
            voice.pan_env_position = env.node_tick(env.loop_start) as i32;
        }

        if env.has_sustain()
            && voice.pan_env_position == env.node_tick(env.sustain_end) as i32 + 1
            && !voice.key_off
        {
            voice.pan_env_position = env.node_tick(env.sustain_start) as i32;
        } else if voice.pan_env_position > env.end_tick() as i32 {
            voice.pan_env_position = env.end_tick() as i32;
        }
    }

    if voice.pitch_env_on {
        let env = &ins.pitch_envelope;
        voice.pitch_env_position += 1;

        if env.has_loop() && voice.pitch_env_position == env.node_tick(env.loop_end) as i32 + 1 {
            voice.pitch_env_position = env.node_tick(env.loop_start) as i32;
        }

        if env.has_sustain()
            && voice.pitch_env_position == env.node_tick(env.sustain_end) as i32 + 1
            && !voice.key_off
        {
            voice.pitch_env_position = env.node_tick(env.sustain_start) as i32;
        } else if voice.pitch_env_position > env.end_tick() as i32 {
            voice.pitch_env_position = env.end_tick() as i32;
        }
    }
}

/// Hxy/Uxy vibrato. Old-effects mode inverts the waveform and deepens the
/// shift, and only advances the phase past the first tick.
fn vibrato(
    voice: &mut Voice,
    prng: &mut Prng,
    flags: SongFlags,
    first_tick: bool,
    mut period: i32,
) -> i32 {
    let old_effects = flags.contains(SongFlags::OLD_EFFECTS);
    let linear = flags.contains(SongFlags::LINEAR_SLIDES);
    let vibpos = voice.vibrato_position & 0xFF;

    let mut vdelta = waveform_value(voice.vibrato_type, vibpos as u8, prng.wave());
    let vdepth = if old_effects {
        vdelta = -vdelta;
        5
    } else {
        6
    };
    vdelta = (vdelta * voice.vibrato_depth as i32) >> vdepth;

    if linear {
        let l = vdelta.unsigned_abs() as usize;
        vdelta = if vdelta < 0 {
            let mut d = muldiv(period, LINEAR_SLIDE_DOWN[l >> 2] as i32, 0x10000) - period;
            if l & 0x03 != 0 {
                d += muldiv(period, FINE_LINEAR_SLIDE_DOWN[l & 0x03] as i32, 0x10000) - period;
            }
            d
        } else {
            let mut d = muldiv(period, LINEAR_SLIDE_UP[l >> 2] as i32, 0x10000) - period;
            if l & 0x03 != 0 {
                d += muldiv(period, FINE_LINEAR_SLIDE_UP[l & 0x03] as i32, 0x10000) - period;
            }
            d
        };
    }

    period -= vdelta;

    if !first_tick || !old_effects {
        voice.vibrato_position = (vibpos + 4 * voice.vibrato_speed) & 0xFF;
    }
    period
}

/// Instrument-level auto-vibrato: sweeps its depth in over time and bends
/// the period through the slide tables with linear interpolation between
/// adjacent entries, carrying an 8-bit fractional period for the frequency
/// conversion.
fn sample_vibrato(
    voice: &mut Voice,
    prng: &mut Prng,
    smp: &Sample,
    old_effects: bool,
    period: &mut i32,
    period_frac: &mut i32,
) {
    let vibpos = voice.autovib_position & 0xFF;

    // Depth sweeps up by the rate each tick until it saturates.
    let mut adepth = voice.autovib_depth + smp.vibrato_rate as i32;
    adepth = adepth.min((smp.vibrato_depth as i32) << 8);
    voice.autovib_depth = adepth;

    voice.autovib_position = voice.autovib_position.wrapping_add(smp.vibrato_speed as u32);

    let val = waveform_value(smp.vibrato_type, vibpos as u8, prng.wave());
    let mut n = (val * adepth) >> 8;
    if !old_effects {
        n >>= 1;
    }

    let (df1, df2);
    if n < 0 {
        n = -n;
        let n1 = (n >> 8) as usize;
        df1 = LINEAR_SLIDE_UP[n1.min(255)] as i32;
        df2 = LINEAR_SLIDE_UP[(n1 + 1).min(255)] as i32;
    } else {
        let n1 = (n >> 8) as usize;
        df1 = LINEAR_SLIDE_DOWN[n1.min(255)] as i32;
        df2 = LINEAR_SLIDE_DOWN[(n1 + 1).min(255)] as i32;
    }
    n >>= 2;

    let scaled = muldiv(*period, df1 + (((df2 - df1) * (n & 0x3F)) >> 6), 256);
    *period_frac = scaled & 0xFF;
    *period = scaled >> 8;
}

/// Jxy arpeggio: substitute a transposed period on two of every three ticks.
fn arpeggio(voice: &Voice, speed: u32, tick_count: u32, linear: bool, period: i32) -> i32 {
    let a = match (speed - tick_count) % 3 {
        1 => (voice.mem_arpeggio >> 4) as i32,
        2 => (voice.mem_arpeggio & 0x0F) as i32,
        _ => 0,
    };
    if a == 0 {
        return period;
    }
    period_transpose(period, a, voice.c5_speed, linear)
}

/// Per-tick VU level: the 8-bit final volume scaled by the sample value
/// under the play head.
fn update_vu_meter(voice: &mut Voice, smp: Option<&Sample>) {
    let mut vutmp = (voice.final_volume >> 6).min(0xFF) as u32;
    let playing = voice.length != 0 && voice.increment != 0;
    match smp {
        Some(smp) if vutmp != 0 && playing => {
            let pos = voice.position.clamp(0, voice.length.saturating_sub(1) as i32) as usize;
            let n = match &smp.data {
                cinder_song::SampleData::Mono8(d) => d.get(pos).copied().unwrap_or(0) as i32,
                cinder_song::SampleData::Mono16(d) => {
                    (d.get(pos).copied().unwrap_or(0) >> 8) as i32
                }
                cinder_song::SampleData::Stereo8(d) => {
                    d.get(pos * 2).copied().unwrap_or(0) as i32
                }
                cinder_song::SampleData::Stereo16(d) => {
                    (d.get(pos * 2).copied().unwrap_or(0) >> 8) as i32
                }
            };
            vutmp = (vutmp * n.unsigned_abs()) >> 7;
            if vutmp != 0 {
                voice.vu_meter = vutmp;
            }
        }
        _ => voice.vu_meter = 0,
    }
}

impl Player {
    /// Recompute every active voice's mixing parameters for this tick.
    pub(crate) fn update_voices(&mut self) {
        let master_vol = (self.song.mixing_volume << 2) as i32; // max 0x200
        let instrument_mode = self.song.instrument_mode();
        let linear = self.song.linear_slides();
        let old_effects = self.song.old_effects();
        let flags = self.song.flags;
        let first_tick = self.first_tick;
        let speed = self.current_speed;
        let tick_count = self.tick_count;

        self.voice_mix.clear();
        let mut list_full = false;

        for idx in 0..MAX_VOICES {
            {
                let voice = &self.voices[idx];
                // A faded-out voice with no residual gain is done for good.
                if voice.note_fade
                    && voice.fadeout_volume == 0
                    && voice.right_volume == 0
                    && voice.left_volume == 0
                {
                    let voice = &mut self.voices[idx];
                    voice.length = 0;
                    voice.rofs = 0;
                    voice.lofs = 0;
                    continue;
                }
                if idx >= MAX_CHANNELS && voice.length == 0 {
                    continue;
                }
            }

            {
                let voice = &mut self.voices[idx];
                voice.increment = 0;
                voice.final_volume = 0;
                voice.final_panning = voice.panning + voice.pan_swing + voice.panbrello_delta;
                voice.ramp_length = 0;
            }

            let (has_period, has_length) = {
                let v = &self.voices[idx];
                (v.period != 0, v.length != 0)
            };

            if has_period && has_length {
                let song = &self.song;
                let prng = &mut self.prng;
                let voice = &mut self.voices[idx];
                let ins = voice.instrument.and_then(|i| song.instrument(i));
                let smp = voice.sample.and_then(|s| song.sample(s));

                // --- Volume path ---
                let mut vol = voice.volume + voice.vol_swing;
                if voice.tremolo_on {
                    vol += voice.tremolo_delta;
                }
                vol = vol.clamp(0, 256);

                if voice.active_fx == ContinuedFx::Tremor {
                    if (voice.cd_tremor & 192) == 128 {
                        vol = 0;
                    }
                    voice.fast_ramp = true;
                }

                vol <<= 6; // 14-bit

                if instrument_mode && ins.is_some() {
                    if let Some(ins) = ins {
                        process_envelopes(voice, ins, &mut vol);
                    }
                } else if voice.note_fade {
                    // No envelope to release into: key off cuts the note.
                    voice.fadeout_volume = 0;
                    vol = 0;
                }

                if vol != 0 {
                    // 14-bit x 7-bit x (6+6)-bit, renormalized back to 14.
                    voice.final_volume = muldiv(
                        vol * self.current_global_volume as i32,
                        voice.channel_volume * voice.instrument_volume,
                        1 << 19,
                    );
                }

                // --- Pitch path ---
                let mut period = voice.period;

                if voice.portamento_on && voice.glissando {
                    period = period_from_note(note_from_period(period), voice.c5_speed, linear);
                }

                if voice.active_fx == ContinuedFx::Arpeggio {
                    period = arpeggio(voice, speed, tick_count, linear, period);
                }

                let mut envpitch = 0;
                if instrument_mode && voice.pitch_env_on {
                    if let Some(ins) = ins {
                        if !ins.pitch_envelope.nodes.is_empty() {
                            envpitch = pitch_filter_envelope(voice, ins, &mut period);
                        }
                    }
                }

                if voice.vibrato_on {
                    period = vibrato(voice, prng, flags, first_tick, period);
                }

                let mut period_frac = 0;
                if let Some(smp) = smp {
                    if smp.vibrato_depth != 0 {
                        sample_vibrato(
                            voice,
                            prng,
                            smp,
                            old_effects,
                            &mut period,
                            &mut period_frac,
                        );
                    }
                }

                let freq = freq_from_period(period, voice.c5_speed, period_frac, linear);
                voice.sample_freq = freq;

                // The filter envelope redirects to the cutoff instead of
                // the period.
                if let Some(ins) = ins {
                    if ins.has_filter_envelope() {
                        let reset = !voice.filter_on;
                        crate::filter::setup_voice_filter(
                            voice,
                            reset,
                            envpitch,
                            self.config.sample_rate as i32,
                        );
                    }
                }

                // --- Resample increment ---
                let mut ninc = muldiv(freq as i32, 0x10000, self.config.sample_rate as i32);
                // Near-unity playback snaps to exactly 1.0 so an unpitched
                // sample never drifts against its own data.
                if (0xFFB0..=0x10090).contains(&ninc) {
                    ninc = 0x10000;
                }
                if self.config.freq_factor != 128 {
                    ninc = (ninc * self.config.freq_factor as i32) >> 7;
                }
                voice.increment = (ninc.min(0xFF0000) + 1) & !3;
            }

            // Envelope cursors advance after their values were used.
            if instrument_mode {
                let song = &self.song;
                let voice = &mut self.voices[idx];
                if let Some(ins) = voice.instrument.and_then(|i| song.instrument(i)) {
                    advance_envelopes(voice, ins);
                }
            }

            {
                let voice = &mut self.voices[idx];
                voice.final_panning = voice.final_panning.clamp(0, 256);

                // Ramp whenever the voice is or was audible.
                voice.ramp_enabled = voice.final_volume != 0
                    || voice.left_volume != 0
                    || voice.right_volume != 0;

                // An increment that strides the whole loop cannot loop.
                if (voice.increment >> 16) + 1 >= voice.loop_end as i32 - voice.loop_start as i32
                {
                    voice.loop_kind = crate::LoopKind::None;
                }

                voice.right_volume_new = 0;
                voice.left_volume_new = 0;
            }

            let mixable = {
                let v = &self.voices[idx];
                v.length != 0 && v.increment != 0 && v.sample.is_some()
            };

            {
                let song = &self.song;
                let voice = &mut self.voices[idx];
                let smp = voice.sample.and_then(|s| song.sample(s));
                update_vu_meter(voice, smp);
            }

            if mixable {
                if !list_full {
                    let master = master_vol;
                    let cfg = self.config;
                    let ramp_samples = self.ramp_samples;
                    let buffer_count = self.buffer_count;
                    let voice = &mut self.voices[idx];
                    crate::gains::update_voice_gains(
                        voice,
                        &cfg,
                        master,
                        ramp_samples,
                        buffer_count,
                    );
                    self.voice_mix.push(idx);
                    if self.voice_mix.len() >= MAX_VOICES {
                        list_full = true;
                    }
                }
            } else {
                let voice = &mut self.voices[idx];
                voice.left_volume = 0;
                voice.right_volume = 0;
                voice.length = 0;
            }
        }

        // Too many audible voices: stable-sort loudest first so the mixer
        // can skip the quietest (they stay alive, just unmixed this chunk).
        if self.voice_mix.len() >= self.config.max_voices as usize
            && !self.config.flags.contains(crate::MixerFlags::DIRECT_TO_DISK)
        {
            let n = self.voice_mix.len();
            for i in 0..n {
                let mut j = i;
                while j + 1 < n
                    && self.voices[self.voice_mix[j]].final_volume
                        < self.voices[self.voice_mix[j + 1]].final_volume
                {
                    self.voice_mix.swap(j, j + 1);
                    j += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_song::{EnvelopeFlags, EnvelopeNode};

    fn env(nodes: &[(u16, u8)]) -> Envelope {
        Envelope {
            nodes: nodes.iter().map(|&(t, v)| EnvelopeNode::new(t, v)).collect(),
            flags: EnvelopeFlags::ENABLED,
            ..Default::default()
        }
    }

    #[test]
    fn envelope_exact_at_nodes() {
        let e = env(&[(0, 0), (10, 64), (20, 16), (100, 48)]);
        assert_eq!(envelope_value(&e, 0), 0);
        assert_eq!(envelope_value(&e, 10), 64);
        assert_eq!(envelope_value(&e, 20), 16);
        assert_eq!(envelope_value(&e, 100), 48);
    }

    #[test]
    fn envelope_interpolates_between_nodes() {
        let e = env(&[(0, 0), (10, 64)]);
        assert_eq!(envelope_value(&e, 5), 32);
        assert_eq!(envelope_value(&e, 1), 6); // truncating division
    }

    #[test]
    fn envelope_clamps_past_the_end() {
        let e = env(&[(0, 10), (10, 40)]);
        assert_eq!(envelope_value(&e, 500), 40);
    }

    #[test]
    fn envelope_advance_loops() {
        let mut e = env(&[(0, 64), (10, 32), (20, 0)]);
        e.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::LOOP;
        e.loop_start = 0;
        e.loop_end = 1;
        let ins = Instrument {
            volume_envelope: e,
            ..Default::default()
        };
        let mut v = Voice {
            vol_env_on: true,
            vol_env_position: 10,
            ..Default::default()
        };
        advance_envelopes(&mut v, &ins);
        // Position 11 is one past the loop-end node's tick, so it wraps.
        assert_eq!(v.vol_env_position, 0);
    }

    #[test]
    fn envelope_end_flags_note_fade() {
        let e = env(&[(0, 64), (10, 0)]);
        let ins = Instrument {
            volume_envelope: e,
            ..Default::default()
        };
        let mut v = Voice {
            vol_env_on: true,
            vol_env_position: 10,
            ..Default::default()
        };
        advance_envelopes(&mut v, &ins);
        assert_eq!(v.vol_env_position, 10);
        assert!(v.note_fade);
        assert_eq!(v.fadeout_volume, 0, "zero final node kills the fade too");
    }

    #[test]
    fn sustain_holds_until_key_off() {
        let mut e = env(&[(0, 64), (10, 64), (20, 0)]);
        e.flags = EnvelopeFlags::ENABLED | EnvelopeFlags::SUSTAIN;
        e.sustain_start = 1;
        e.sustain_end = 1;
        let ins = Instrument {
            volume_envelope: e,
            ..Default::default()
        };
        let mut v = Voice {
            vol_env_on: true,
            vol_env_position: 10,
            ..Default::default()
        };
        advance_envelopes(&mut v, &ins);
        assert_eq!(v.vol_env_position, 10, "held at sustain");
        v.key_off = true;
        v.vol_env_position = 10;
        advance_envelopes(&mut v, &ins);
        assert_eq!(v.vol_env_position, 11, "released past sustain");
    }

    #[test]
    fn arpeggio_three_tick_cycle() {
        let voice = Voice {
            mem_arpeggio: 0x37,
            c5_speed: 8363,
            ..Default::default()
        };
        let period = 1712;
        // Tick 0 of the row: base period.
        assert_eq!(arpeggio(&voice, 6, 6, true, period), period);
        // Tick 1: +3 semitones (x nibble), so a smaller period.
        let t1 = arpeggio(&voice, 6, 5, true, period);
        assert!(t1 < period);
        // Tick 2: +7 semitones, smaller still.
        let t2 = arpeggio(&voice, 6, 4, true, period);
        assert!(t2 < t1);
        // Tick 3 repeats the cycle.
        assert_eq!(arpeggio(&voice, 6, 3, true, period), period);
    }
}
