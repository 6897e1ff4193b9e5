//! Whole-player integration tests: rendering real songs through the full
//! sequencer → modulation → mix → conversion path.

use cinder_song::{
    Command, Instrument, Pattern, Sample, SampleData, SampleFlags, Song, SongFlags,
    VolumeCommand, ORDER_LAST,
};

use crate::{export, BitDepth, Interpolation, MixerConfig, Player};

/// A one-pattern song: a looping constant-value sample keyed at C-5 on
/// channel 0, row 0. Sample mode, linear slides.
pub(crate) fn one_note_song() -> Song {
    let mut sample = Sample::new(SampleData::Mono16(vec![8192; 64]), 8363);
    sample.loop_start = 0;
    sample.loop_end = 64;
    sample.flags = SampleFlags::LOOP;

    let mut pattern = Pattern::blank(64);
    pattern.cell_mut(0, 0).note = 61; // C-5
    pattern.cell_mut(0, 0).instrument = 1;

    let mut song = Song {
        flags: SongFlags::LINEAR_SLIDES,
        orders: vec![0, ORDER_LAST],
        patterns: vec![Some(pattern)],
        samples: vec![Sample::default(), sample],
        ..Default::default()
    };
    song.sanitize();
    song
}

pub(crate) fn player_for(song: Song) -> Player {
    Player::new(song, MixerConfig::default())
}

fn render_frames(player: &mut Player, frames: usize, chunk: usize) -> Vec<u8> {
    let frame_bytes = player.config().frame_bytes();
    let mut out = Vec::with_capacity(frames * frame_bytes);
    let mut buf = vec![0u8; chunk * frame_bytes];
    let mut remaining = frames;
    while remaining > 0 {
        let want = remaining.min(chunk);
        let got = player.render(&mut buf[..want * frame_bytes]);
        out.extend_from_slice(&buf[..got * frame_bytes]);
        if got < want {
            break;
        }
        remaining -= got;
    }
    out
}

#[test]
fn renders_audible_output() {
    let mut player = player_for(one_note_song());
    let pcm = render_frames(&mut player, 2048, 512);
    assert_eq!(pcm.len(), 2048 * 4);
    assert!(pcm.iter().any(|&b| b != 0), "a keyed note produces sound");
}

#[test]
fn double_render_is_byte_identical() {
    let mut a = player_for(one_note_song());
    let mut b = player_for(one_note_song());
    let pcm_a = render_frames(&mut a, 8192, 512);
    let pcm_b = render_frames(&mut b, 8192, 512);
    assert_eq!(pcm_a, pcm_b);
}

#[test]
fn restart_renders_identically() {
    let mut player = player_for(one_note_song());
    let first = render_frames(&mut player, 4096, 512);
    player.start();
    let second = render_frames(&mut player, 4096, 512);
    assert_eq!(first, second, "start() fully rewinds playback state");
}

#[test]
fn chunk_size_does_not_change_output() {
    let mut a = player_for(one_note_song());
    let mut b = player_for(one_note_song());
    let pcm_a = render_frames(&mut a, 4410, 147);
    let pcm_b = render_frames(&mut b, 4410, 1024);
    assert_eq!(pcm_a, pcm_b);
}

#[test]
fn export_matches_live_render() {
    // The hard parity requirement: the disk-writer path and a live-style
    // drain of the same song must produce identical PCM.
    let mut live = player_for(one_note_song());
    live.set_repeat_count(1);
    let live_pcm = render_frames(&mut live, 400_000, 480);

    let mut offline = player_for(one_note_song());
    offline.set_repeat_count(1);
    let mut sink = export::tests_support::CaptureSink::new();
    export::export(&mut offline, &mut sink, None).unwrap();

    assert_eq!(sink.frames * offline.config().frame_bytes(), sink.pcm.len());
    assert_eq!(sink.pcm, live_pcm);
}

#[test]
fn finite_repeat_ends_short_render() {
    let mut player = player_for(one_note_song());
    player.set_repeat_count(1);
    // 64 rows x 6 ticks x 882 frames at speed 6 / 125 BPM / 44.1 kHz.
    let song_frames = 64 * 6 * 882;
    let frame_bytes = player.config().frame_bytes();
    let mut buf = vec![0u8; (song_frames + 5000) * frame_bytes];
    let rendered = player.render(&mut buf);
    assert_eq!(rendered, song_frames);
    assert_eq!(player.render(&mut buf), 0, "the song stays ended");
    // The unrendered tail is silence-filled for the caller.
    assert!(buf[rendered * frame_bytes..].iter().all(|&b| b == 0));
}

#[test]
fn infinite_repeat_keeps_rendering() {
    let mut player = player_for(one_note_song());
    player.set_repeat_count(0);
    let song_frames = 64 * 6 * 882;
    let pcm = render_frames(&mut player, song_frames + 10_000, 1024);
    assert_eq!(pcm.len(), (song_frames + 10_000) * 4);
    assert!(!player.status().end_reached);
}

#[test]
fn muted_channel_renders_silence() {
    let mut song = one_note_song();
    song.channels[0].muted = true;
    let mut player = player_for(song);
    let pcm = render_frames(&mut player, 4096, 512);
    assert!(pcm.iter().all(|&b| b == 0), "muted voices never sound");
}

#[test]
fn resample_increment_snaps_to_unity() {
    // 44050 Hz against a 44100 Hz mixer is within the snap band.
    let mut song = one_note_song();
    song.samples[1].c5_speed = 44_050;
    let mut player = player_for(song);
    assert!(player.read_note());
    assert_eq!(player.voices[0].increment, 0x10000);

    // 43000 Hz is outside the band and resamples for real.
    let mut song = one_note_song();
    song.samples[1].c5_speed = 43_000;
    let mut player = player_for(song);
    assert!(player.read_note());
    let expected = (crate::muldiv(43_000, 0x10000, 44_100) + 1) & !3;
    assert_eq!(player.voices[0].increment, expected);
    assert_ne!(player.voices[0].increment, 0x10000);
}

#[test]
fn note_volume_column_applies() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(0, 0).volume = VolumeCommand::Volume(32);
    }
    let mut player = player_for(song);
    assert!(player.read_note());
    assert_eq!(player.voices[0].volume, 128);
}

#[test]
fn note_cut_effect_stops_the_voice() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(0, 0).command = Command::Special(0xC2); // cut after 2 ticks
    }
    let mut player = player_for(song);
    assert!(player.read_note());
    assert!(player.voices[0].is_active());
    assert!(player.read_note());
    assert!(player.voices[0].is_active(), "cut countdown still running");
    assert!(player.read_note());
    assert!(!player.voices[0].is_active(), "SC2 cuts on the second tick");
}

#[test]
fn pattern_break_skips_to_next_order() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(1, 0).command = Command::PatternBreak(4);
    }
    song.patterns.push(Some(Pattern::blank(64)));
    song.orders = vec![0, 1, ORDER_LAST];
    let mut player = player_for(song);

    // Row 0 (6 ticks), then row 1 fires the break; the next row boundary
    // lands on pattern 1, row 4.
    for _ in 0..12 {
        assert!(player.read_note());
    }
    assert!(player.read_note());
    assert_eq!(player.current_order, 1);
    assert_eq!(player.row, 4);
}

#[test]
fn position_jump_restarts_order_zero() {
    let mut song = one_note_song();
    song.patterns.push(Some(Pattern::blank(8)));
    if let Some(pat) = song.patterns[1].as_mut() {
        pat.cell_mut(0, 0).command = Command::PositionJump(0);
    }
    song.orders = vec![0, 1, ORDER_LAST];
    let mut player = player_for(song);
    player.start_at_order(1);

    for _ in 0..6 {
        assert!(player.read_note());
    }
    assert!(player.read_note());
    assert_eq!(player.current_order, 0);
    assert_eq!(player.row, 0);
}

#[test]
fn loop_pattern_counts_repeats() {
    let mut player = player_for(one_note_song());
    player.loop_pattern(0, 0);
    player.set_repeat_count(1);
    let ticks_per_pass = 64 * 6;
    for _ in 0..ticks_per_pass {
        assert!(player.read_note());
    }
    assert!(!player.read_note(), "one pass of the looped pattern, then end");
}

#[test]
fn speed_command_changes_row_length() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(1, 0).command = Command::SetSpeed(3);
    }
    let mut player = player_for(song);
    for _ in 0..6 {
        assert!(player.read_note());
    }
    assert_eq!(player.row, 0);
    // Row 1 onward takes three ticks.
    for _ in 0..3 {
        assert!(player.read_note());
    }
    assert_eq!(player.row, 1);
    assert!(player.read_note());
    assert_eq!(player.row, 2);
}

#[test]
fn tempo_command_changes_tick_frames() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(0, 0).command = Command::Tempo(0x96); // 150 BPM
    }
    let mut player = player_for(song);
    assert!(player.read_note());
    assert_eq!(player.status().tempo, 150);
    assert_eq!(player.buffer_count, 44_100 * 5 * 128 / (150 << 8));
}

#[test]
fn instrument_mode_note_triggers_envelopes() {
    let mut song = one_note_song();
    song.flags = SongFlags::LINEAR_SLIDES | SongFlags::INSTRUMENT_MODE;
    let mut ins = Instrument::default();
    for entry in ins.keyboard.iter_mut() {
        entry.sample = 1;
    }
    ins.volume_envelope.flags =
        cinder_song::EnvelopeFlags::ENABLED | cinder_song::EnvelopeFlags::LOOP;
    song.instruments = vec![None, Some(ins)];
    let mut player = player_for(song);
    assert!(player.read_note());
    assert_eq!(player.voices[0].instrument, Some(1));
    assert!(player.voices[0].vol_env_on);
    assert!(player.voices[0].is_active());
}

#[test]
fn nearest_and_linear_interpolation_differ() {
    let mut ramp = Vec::with_capacity(64);
    for i in 0..64i16 {
        ramp.push(i * 512);
    }
    let make = |interp| {
        let mut song = one_note_song();
        song.samples[1] = {
            let mut s = Sample::new(SampleData::Mono16(ramp.clone()), 10_000);
            s.flags = SampleFlags::LOOP;
            s.loop_end = 64;
            s.sanitize();
            s
        };
        Player::new(
            song,
            MixerConfig {
                interpolation: interp,
                ..Default::default()
            },
        )
    };
    let mut nearest = make(Interpolation::Nearest);
    let mut linear = make(Interpolation::Linear);
    let pcm_n = render_frames(&mut nearest, 2048, 512);
    let pcm_l = render_frames(&mut linear, 2048, 512);
    assert_ne!(pcm_n, pcm_l);
}

#[test]
fn eight_bit_output_is_unsigned_silence() {
    let mut song = one_note_song();
    song.patterns[0] = Some(Pattern::blank(64)); // no note at all
    let mut player = Player::new(
        song,
        MixerConfig {
            bit_depth: BitDepth::Bits8,
            channels: 1,
            ..Default::default()
        },
    );
    let frame_bytes = player.config().frame_bytes();
    assert_eq!(frame_bytes, 1);
    let mut buf = vec![0u8; 1024];
    let rendered = player.render(&mut buf);
    assert!(rendered > 0);
    assert!(buf[..rendered].iter().all(|&b| b == 0x80));
}

#[test]
fn status_reports_position() {
    let mut player = player_for(one_note_song());
    for _ in 0..8 {
        assert!(player.read_note());
    }
    let status = player.status();
    assert_eq!(status.row, 1);
    assert_eq!(status.speed, 6);
    assert_eq!(status.tempo, 125);
    assert_eq!(status.tick, 1);
}

#[test]
fn playing_sample_bitmap() {
    let mut player = player_for(one_note_song());
    assert!(player.read_note());
    let mut playing = [false; 4];
    player.playing_samples(&mut playing);
    assert!(playing[1]);
    assert!(!playing[2]);
}

#[test]
fn empty_note_row_is_quiet_noop() {
    // A row of default cells must not disturb a playing note.
    let mut player = player_for(one_note_song());
    for _ in 0..20 {
        assert!(player.read_note());
    }
    assert!(player.voices[0].is_active());
    assert_eq!(player.voices[0].note, 61);
}

#[test]
fn vibrato_effect_wobbles_the_period() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(0, 0).command = Command::Vibrato(0x48);
        for row in 1..8 {
            pat.cell_mut(row, 0).command = Command::Vibrato(0);
        }
    }
    let mut player = player_for(song);
    let base = {
        assert!(player.read_note());
        player.voices[0].period
    };
    let mut freqs = std::collections::BTreeSet::new();
    for _ in 0..24 {
        assert!(player.read_note());
        freqs.insert(player.voices[0].sample_freq);
    }
    assert!(freqs.len() > 2, "vibrato modulates the frequency over time");
    assert_eq!(player.voices[0].period, base, "base period is untouched");
}

#[test]
fn tone_portamento_glides_between_notes() {
    let mut song = one_note_song();
    if let Some(pat) = song.patterns[0].as_mut() {
        pat.cell_mut(4, 0).note = 73; // C-6, an octave up
        pat.cell_mut(4, 0).command = Command::TonePortamento(0x20);
        for row in 5..32 {
            pat.cell_mut(row, 0).command = Command::TonePortamento(0);
        }
    }
    let mut player = player_for(song);
    for _ in 0..6 {
        assert!(player.read_note());
    }
    let start = player.voices[0].period;
    let target = crate::pitch::period_from_note(73, 8363, true);
    assert_eq!(player.voices[0].portamento_target, 0);

    for _ in 0..6 * 4 {
        assert!(player.read_note());
    }
    assert!(player.voices[0].portamento_target != 0 || player.voices[0].period == target);
    let mid = player.voices[0].period;
    assert!(mid < start, "period slid toward the higher note");

    for _ in 0..6 * 24 {
        assert!(player.read_note());
    }
    assert_eq!(player.voices[0].period, target, "portamento converges exactly");
}
