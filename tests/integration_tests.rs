//! Black-box coverage driving the engine end to end through `Mixer`'s
//! public surface only: bank loading, Song event dispatch, voice
//! stealing, reverb, and tempo scaling.

use dsynth::midi::MidiEvent;
use dsynth::mixer::reverb::{NeoPreset, ReverbType};
use dsynth::mixer::{Mixer, MixerConfig};
use dsynth::song::LiveEventQueue;
use dsynth::sound::{FillSource, FillStatus};

// -- Native bank encoding -------------------------------------------
//
// Mirrors the wire format documented on `dsynth::bank::native`, built
// fresh here since that module's own encoder is a private test helper.

struct SampleSpec {
    frame_count: u32,
    sample_rate: u32,
    root_pitch: u8,
    loop_start: u32,
    loop_end: u32,
    pcm: Vec<i16>,
}

struct StageSpec {
    target_level: i32,
    duration_us: u32,
    flag: u8,
}

struct InstrumentSpec {
    bank_msb: u8,
    bank_lsb: u8,
    program: u8,
    stages: Vec<StageSpec>,
}

fn encode_bank(sample: &SampleSpec, instrument: &InstrumentSpec) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"BAEB");

    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.push(1); // mono
    buf.extend_from_slice(&sample.frame_count.to_le_bytes());
    buf.extend_from_slice(&sample.sample_rate.to_le_bytes());
    buf.push(sample.root_pitch);
    buf.extend_from_slice(&0i16.to_le_bytes()); // fine_tune_cents
    buf.extend_from_slice(&sample.loop_start.to_le_bytes());
    buf.extend_from_slice(&sample.loop_end.to_le_bytes());
    for s in &sample.pcm {
        buf.extend_from_slice(&s.to_le_bytes());
    }

    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.push(instrument.bank_msb);
    buf.push(instrument.bank_lsb);
    buf.push(instrument.program);
    buf.extend_from_slice(&0u32.to_le_bytes()); // sample_index
    buf.push(0); // pan
    buf.push(0); // flags
    buf.push(instrument.stages.len() as u8);
    for stage in &instrument.stages {
        buf.extend_from_slice(&stage.target_level.to_le_bytes());
        buf.extend_from_slice(&stage.duration_us.to_le_bytes());
        buf.push(stage.flag);
    }
    buf
}

/// A looped, sustaining instrument on (0, 0, 0): attack, indefinite
/// sustain, 20ms release, terminate.
fn piano_bank() -> Vec<u8> {
    let frame_count = 8;
    let pcm = (0..frame_count)
        .map(|i| if i % 2 == 0 { 16_000 } else { -16_000 })
        .collect();
    let sample = SampleSpec {
        frame_count,
        sample_rate: 44_100,
        root_pitch: 60,
        loop_start: 0,
        loop_end: frame_count,
        pcm,
    };
    let instrument = InstrumentSpec {
        bank_msb: 0,
        bank_lsb: 0,
        program: 0,
        stages: vec![
            StageSpec { target_level: 4096, duration_us: 2_000, flag: 0 }, // LinearRamp
            StageSpec { target_level: 4096, duration_us: 1, flag: 1 },     // SustainUntilNoteOff
            StageSpec { target_level: 0, duration_us: 20_000, flag: 2 },   // Release
            StageSpec { target_level: 0, duration_us: 1, flag: 3 },        // Terminate
        ],
    };
    encode_bank(&sample, &instrument)
}

/// A short, non-looped percussion instrument on the odd-numbered drum
/// bank 121: envelope alone never ends it, only sample-end does.
fn drum_bank() -> Vec<u8> {
    let frame_count = 16;
    let pcm = (0..frame_count)
        .map(|i| if i % 2 == 0 { 20_000 } else { -20_000 })
        .collect();
    let sample = SampleSpec {
        frame_count,
        sample_rate: 44_100,
        root_pitch: 60,
        loop_start: 0,
        loop_end: 0, // not looped
        pcm,
    };
    let instrument = InstrumentSpec {
        bank_msb: 121,
        bank_lsb: 0,
        program: 0,
        stages: vec![
            StageSpec { target_level: 4096, duration_us: 500, flag: 0 },
            StageSpec { target_level: 4096, duration_us: 1, flag: 1 },
        ],
    };
    encode_bank(&sample, &instrument)
}

fn block_abs_max(buf: &[i16]) -> i32 {
    buf.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0)
}

fn small_mixer() -> Mixer {
    Mixer::open(MixerConfig {
        sample_rate: 44_100,
        max_song_voices: 8,
        max_sound_voices: 4,
        mix_level: 1.0,
    })
}

#[test]
fn piano_note_sustains_then_releases_to_silence() {
    let mut mixer = small_mixer();
    mixer.load_native_bank(&piano_bank()).unwrap();
    let id = mixer.add_song(Box::new(LiveEventQueue::new()));
    mixer.song_mut(id).unwrap().start();
    mixer.song_mut(id).unwrap().note_on(0, 60, 100);

    let mut buf = vec![0i16; 512 * 2];
    mixer.render_block(&mut buf);
    assert!(block_abs_max(&buf) > 0, "note-on should produce audible output while sustaining");

    mixer.song_mut(id).unwrap().note_off(0, 60);
    // Drain well past the 20ms release stage (~882 ticks at 44100Hz).
    let mut buf2 = vec![0i16; 4096 * 2];
    mixer.render_block(&mut buf2);
    mixer.render_block(&mut buf2);
    assert_eq!(block_abs_max(&buf2), 0, "voice should be silent after the release stage completes");
}

#[test]
fn drum_hit_auto_terminates_without_note_off() {
    let mut mixer = small_mixer();
    mixer.load_native_bank(&drum_bank()).unwrap();
    let id = mixer.add_song(Box::new(LiveEventQueue::new()));
    mixer.song_mut(id).unwrap().start();
    mixer.song_mut(id).unwrap().controller(0, 0, 121); // CC0 selects the percussion bank
    mixer.song_mut(id).unwrap().note_on(0, 60, 100);

    let mut buf = vec![0i16; 64 * 2];
    mixer.render_block(&mut buf);
    assert!(block_abs_max(&buf) > 0, "drum hit should be audible immediately");

    let mut buf2 = vec![0i16; 2048 * 2];
    mixer.render_block(&mut buf2);
    assert!(
        buf2.iter().all(|&s| s == 0),
        "one-shot drum voice must auto-terminate at sample end with no note_off"
    );
}

#[test]
fn sustain_pedal_holds_note_through_note_off() {
    let mut mixer = small_mixer();
    mixer.load_native_bank(&piano_bank()).unwrap();
    let id = mixer.add_song(Box::new(LiveEventQueue::new()));
    mixer.song_mut(id).unwrap().start();
    mixer.song_mut(id).unwrap().note_on(0, 60, 100);
    mixer.song_mut(id).unwrap().controller(0, 64, 127); // pedal down

    let mut buf = vec![0i16; 256 * 2];
    mixer.render_block(&mut buf);
    assert!(block_abs_max(&buf) > 0);

    mixer.song_mut(id).unwrap().note_off(0, 60);
    let mut buf2 = vec![0i16; 256 * 2];
    mixer.render_block(&mut buf2);
    assert!(block_abs_max(&buf2) > 0, "note-off under a held pedal must not silence the voice");

    mixer.song_mut(id).unwrap().controller(0, 64, 0); // pedal up
    let mut buf3 = vec![0i16; 4096 * 2];
    mixer.render_block(&mut buf3);
    mixer.render_block(&mut buf3);
    assert_eq!(
        block_abs_max(&buf3),
        0,
        "releasing the pedal should sweep the note into release and silence it"
    );
}

#[test]
fn voice_stealing_caps_active_voices_at_pool_size() {
    let mut mixer = Mixer::open(MixerConfig {
        sample_rate: 44_100,
        max_song_voices: 4,
        max_sound_voices: 4,
        mix_level: 1.0,
    });
    mixer.load_native_bank(&piano_bank()).unwrap();
    let id = mixer.add_song(Box::new(LiveEventQueue::new()));
    mixer.song_mut(id).unwrap().start();
    for note in [60u8, 61, 62, 63, 64] {
        mixer.song_mut(id).unwrap().note_on(0, note, 100);
    }

    let mut buf = vec![0i16; 16 * 2];
    mixer.render_block(&mut buf);
    assert_eq!(
        mixer.active_song_voice_count(),
        4,
        "a fifth note-on over a 4-voice pool must steal rather than overflow it"
    );
}

struct BurstSource {
    remaining: usize,
}

impl FillSource for BurstSource {
    fn fill(&mut self, out: &mut [i16]) -> FillStatus {
        if self.remaining == 0 {
            return FillStatus::Eof;
        }
        let n = out.len().min(self.remaining);
        for s in out.iter_mut().take(n) {
            *s = i16::MAX;
        }
        self.remaining -= n;
        FillStatus::Ok(n)
    }
}

#[test]
fn neo_room_reverb_tail_decays_to_silence() {
    let mut mixer = Mixer::open(MixerConfig::default());
    mixer.set_reverb_type(ReverbType::Neo(NeoPreset::Room));
    let id = mixer
        .add_sound(Box::new(BurstSource { remaining: 512 }), 44_100, 1, 16)
        .unwrap();
    mixer.sound_mut(id).unwrap().set_reverb_send(1.0);
    mixer.sound_mut(id).unwrap().start();

    let mut buf = vec![0i16; 256 * 2];
    let mut heard_audio = false;
    for _ in 0..4 {
        mixer.render_block(&mut buf);
        if block_abs_max(&buf) > 0 {
            heard_audio = true;
        }
    }
    assert!(heard_audio, "burst plus reverb send should produce audible output");

    // Let the comb/allpass network ring down with no further input;
    // Room's 0.55 feedback converges well inside this budget.
    for _ in 0..2000 {
        mixer.render_block(&mut buf);
    }
    assert_eq!(block_abs_max(&buf), 0, "Room reverb tail should fully decay given enough silence");
}

fn frames_until_voice_active(tempo_percent: u32) -> u32 {
    let mut mixer = small_mixer();
    mixer.load_native_bank(&piano_bank()).unwrap();
    let mut stream = LiveEventQueue::new();
    stream.push(500_000, MidiEvent::NoteOn { channel: 0, note: 60, velocity: 100 });
    let id = mixer.add_song(Box::new(stream));
    mixer.song_mut(id).unwrap().set_tempo_percent(tempo_percent);
    mixer.song_mut(id).unwrap().start();

    let mut buf = vec![0i16; 64 * 2];
    for block in 0..20_000u32 {
        mixer.render_block(&mut buf);
        if mixer.active_song_voice_count() > 0 {
            return block * 64;
        }
    }
    panic!("scripted note-on never dispatched");
}

#[test]
fn tempo_increase_speeds_up_scripted_event_dispatch() {
    let frames_at_100 = frames_until_voice_active(100);
    let frames_at_200 = frames_until_voice_active(200);
    assert!(
        frames_at_200 < frames_at_100,
        "200% tempo ({frames_at_200} frames) should dispatch the scripted note sooner than 100% tempo ({frames_at_100} frames)"
    );
}
