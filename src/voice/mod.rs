//! Voice & Envelope Engine: the fixed-size polyphonic voice pool, its
//! allocation/stealing policy, and the per-voice DSP pipeline.

pub mod envelope;
pub mod filter;
pub mod lfo;

use crate::bank::{InstrumentFlags, LfoDestination, ResolvedInstrument, Sample};
use crate::command::{SongId, SoundId};
use crate::fixed::Fixed;
use envelope::{Envelope, EnvelopeMode};
use filter::{BiquadLowpass, OnePoleLowpass};
use lfo::RunningLfo;
use std::sync::Arc;

const STEAL_RELEASE_MS: f32 = 5.0;
const MAX_ENV_FAIL_TICKS: u32 = 10 * 44100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Attacking,
    Decaying,
    Sustaining,
    Releasing,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceOwner {
    Song { song: SongId, channel: u8 },
    Sound { sound: SoundId },
}

/// Per-channel (or per-sound) context a voice needs to render one
/// frame, supplied by the caller (Song/Mixer) each block so the voice
/// itself stays free of back-references.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub channel_volume: f32,
    pub channel_expression: f32,
    pub channel_pan: f32,
    pub pitch_bend_semitones: f32,
    pub song_volume: f32,
    pub master_volume: f32,
    pub reverb_send: f32,
}

impl Default for FrameContext {
    fn default() -> Self {
        Self {
            channel_volume: 1.0,
            channel_expression: 1.0,
            channel_pan: 0.0,
            pitch_bend_semitones: 0.0,
            song_volume: 1.0,
            master_volume: 1.0,
            reverb_send: 0.0,
        }
    }
}

enum FilterKind {
    OnePole(OnePoleLowpass),
    Biquad(BiquadLowpass),
}

impl FilterKind {
    fn process(&mut self, input: f32) -> f32 {
        match self {
            FilterKind::OnePole(f) => f.process(input),
            FilterKind::Biquad(f) => f.process(input),
        }
    }

    fn set_cutoff(&mut self, cutoff_hz: f32) {
        match self {
            FilterKind::OnePole(f) => f.set_cutoff(cutoff_hz),
            FilterKind::Biquad(f) => f.set_cutoff(cutoff_hz),
        }
    }
}

pub struct Voice {
    state: VoiceState,
    owner: Option<VoiceOwner>,
    sample: Option<Arc<Sample>>,
    position: Fixed,
    sample_rate_out: u32,
    base_pitch_ratio: f64,
    root_pitch: u8,
    note: u8,
    velocity: u8,
    volume_env: Option<Envelope>,
    pitch_env: Option<Envelope>,
    filter_env: Option<Envelope>,
    lfos: Vec<RunningLfo>,
    filter: Option<FilterKind>,
    base_filter_cutoff: f32,
    pan: f32,
    flags: InstrumentFlags,
    note_on_seq: u64,
    malformed_env_ticks: u32,
}

impl Voice {
    pub fn new(sample_rate_out: u32) -> Self {
        Self {
            state: VoiceState::Idle,
            owner: None,
            sample: None,
            position: Fixed::ZERO,
            sample_rate_out,
            base_pitch_ratio: 1.0,
            root_pitch: 60,
            note: 60,
            velocity: 0,
            volume_env: None,
            pitch_env: None,
            filter_env: None,
            lfos: Vec::new(),
            filter: None,
            base_filter_cutoff: 20000.0,
            pan: 0.0,
            flags: InstrumentFlags::default(),
            note_on_seq: 0,
            malformed_env_ticks: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == VoiceState::Idle
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn owner(&self) -> Option<VoiceOwner> {
        self.owner
    }

    pub fn note(&self) -> u8 {
        self.note
    }

    pub fn note_on_seq(&self) -> u64 {
        self.note_on_seq
    }

    /// Binds this (assumed idle or stolen) voice to a new note,
    /// (re)initializing its envelopes, LFOs and filter from a resolved
    /// instrument. Transitions `idle -> attacking`.
    pub fn bind(
        &mut self,
        owner: VoiceOwner,
        note: u8,
        velocity: u8,
        instrument: &ResolvedInstrument,
        note_on_seq: u64,
    ) {
        self.owner = Some(owner);
        self.sample = Some(instrument.sample.clone());
        self.position = Fixed::ZERO;
        self.root_pitch = instrument.root_pitch;
        self.note = note;
        self.velocity = velocity;
        self.note_on_seq = note_on_seq;
        self.flags = instrument.flags;
        self.pan = instrument.pan as f32 / 63.0;
        self.malformed_env_ticks = 0;

        self.base_pitch_ratio = instrument.sample.native_sample_rate as f64
            / self.sample_rate_out as f64
            * 2f64.powf(instrument.sample.fine_tune_cents as f64 / 1200.0);

        self.volume_env = Some(Envelope::new(instrument.volume_adsr.clone()));
        self.pitch_env = instrument
            .pitch_adsr
            .clone()
            .map(Envelope::new);
        self.filter_env = instrument.filter_adsr.clone().map(Envelope::new);

        self.lfos = instrument
            .lfos
            .iter()
            .map(|d| RunningLfo::new(d, self.sample_rate_out))
            .collect();

        self.base_filter_cutoff = instrument
            .filter
            .map(|f| f.cutoff_hz)
            .unwrap_or(20000.0);
        self.filter = instrument.filter.map(|f| {
            if f.resonance > 0.8 {
                FilterKind::Biquad(BiquadLowpass::new(
                    self.sample_rate_out as f32,
                    f.cutoff_hz,
                    f.resonance,
                ))
            } else {
                FilterKind::OnePole(OnePoleLowpass::new(self.sample_rate_out as f32, f.cutoff_hz))
            }
        });

        self.state = VoiceState::Attacking;
    }

    /// Mono-voice-only retrigger: restart envelopes/phase but keep the
    /// current amplitude level.
    pub fn retrigger(&mut self, velocity: u8, note_on_seq: u64) {
        self.velocity = velocity;
        self.note_on_seq = note_on_seq;
        if let Some(env) = &mut self.volume_env {
            let stages = env.stages_clone();
            env.restart_from_current_level(stages);
        }
        self.position = Fixed::ZERO;
        self.state = VoiceState::Attacking;
    }

    pub fn note_off(&mut self) {
        if matches!(
            self.state,
            VoiceState::Releasing | VoiceState::Terminating | VoiceState::Idle
        ) {
            return; // idempotent
        }
        if let Some(env) = &mut self.volume_env {
            env.note_off();
        }
        self.state = VoiceState::Releasing;
    }

    /// Forces a fast linear release for voice stealing.
    pub fn force_steal(&mut self) {
        let ticks = (STEAL_RELEASE_MS / 1000.0 * self.sample_rate_out as f32) as u32;
        if let Some(env) = &mut self.volume_env {
            env.force_steal_release(ticks.max(1));
        }
        self.state = VoiceState::Releasing;
    }

    fn retire(&mut self) {
        self.state = VoiceState::Idle;
        self.owner = None;
        self.sample = None;
        self.volume_env = None;
        self.pitch_env = None;
        self.filter_env = None;
        self.lfos.clear();
        self.filter = None;
    }

    /// Steal-score tuple (lower = stolen first). State preference is
    /// releasing < sustaining < decaying < attacking, tiebroken by
    /// lower envelope level then older note-on timestamp.
    pub fn steal_score(&self) -> (u8, ordered_float::NotNanOrd, u64) {
        let state_rank = match self.state {
            VoiceState::Releasing | VoiceState::Terminating => 0,
            VoiceState::Sustaining => 1,
            VoiceState::Decaying => 2,
            VoiceState::Attacking => 3,
            VoiceState::Idle => 4,
        };
        let level = self.volume_env.as_ref().map(|e| e.level()).unwrap_or(0.0);
        (state_rank, ordered_float::NotNanOrd(level), self.note_on_seq)
    }

    /// Advances the voice by one output frame and returns its (left,
    /// right, reverb-send) contribution, already scaled by all gain
    /// stages in the voice's DSP chain.
    pub fn process_frame(&mut self, ctx: &FrameContext) -> (f32, f32, f32) {
        if self.state == VoiceState::Idle {
            return (0.0, 0.0, 0.0);
        }

        let vol_level = match &mut self.volume_env {
            Some(env) => {
                let l = env.advance();
                self.track_envelope_health(env);
                l
            }
            None => 0.0,
        };
        self.update_state_from_envelope();

        let pitch_cents_env = match &mut self.pitch_env {
            Some(env) => env.advance() * 100.0,
            None => 0.0,
        };
        let filter_cents_env = match &mut self.filter_env {
            Some(env) => env.advance() * 100.0,
            None => 0.0,
        };

        let mut pitch_lfo_cents = 0.0f32;
        let mut volume_lfo_cb = 0.0f32;
        let mut filter_lfo_cents = 0.0f32;
        let mut pan_lfo = 0.0f32;
        for lfo in &mut self.lfos {
            let v = lfo.advance();
            match lfo.destination() {
                LfoDestination::Pitch => pitch_lfo_cents += v,
                LfoDestination::Volume => volume_lfo_cb += v,
                LfoDestination::FilterCutoff => filter_lfo_cents += v,
                LfoDestination::StereoPan => pan_lfo += v,
            }
        }

        let semis = self.note as i32 - self.root_pitch as i32;
        let bend_cents = ctx.pitch_bend_semitones * 100.0;
        let total_cents = semis as f64 * 100.0 + bend_cents as f64 + pitch_cents_env as f64
            + pitch_lfo_cents as f64;
        let rate = self.base_pitch_ratio * 2f64.powf(total_cents / 1200.0);

        let sample = match &self.sample {
            Some(s) => s.clone(),
            None => return (0.0, 0.0, 0.0),
        };

        let frame_idx = self.position.frame_part();
        let frac = self.position.frac_part();
        let (l0, r0) = sample.frame_at(frame_idx);
        let (l1, r1) = sample.frame_at(frame_idx + 1);
        let left = l0 as f32 + (l1 as f32 - l0 as f32) * frac;
        let right = r0 as f32 + (r1 as f32 - r0 as f32) * frac;

        self.advance_position(rate, &sample);

        let mut mono = (left + right) / 2.0 / i16::MAX as f32;
        let mut stereo_l = left / i16::MAX as f32;
        let mut stereo_r = right / i16::MAX as f32;

        if let Some(filter) = &mut self.filter {
            let cutoff = (self.base_filter_cutoff + filter_cents_env_to_hz(filter_cents_env)
                + filter_cents_env_to_hz(filter_lfo_cents))
            .clamp(20.0, self.sample_rate_out as f32 * 0.49);
            filter.set_cutoff(cutoff);
            stereo_l = filter.process(stereo_l);
            stereo_r = filter.process(stereo_r);
            mono = (stereo_l + stereo_r) / 2.0;
        }

        let volume_mult = (1.0 + volume_lfo_cb / 100.0).max(0.0);
        let gain = vol_level
            * ctx.channel_volume
            * ctx.channel_expression
            * ctx.song_volume
            * ctx.master_volume
            * volume_mult;

        let pan = (self.pan + ctx.channel_pan + pan_lfo / 63.0).clamp(-1.0, 1.0);
        let left_gain = gain * (1.0 - pan.max(0.0));
        let right_gain = gain * (1.0 + pan.min(0.0));

        let out_l = stereo_l * left_gain;
        let out_r = stereo_r * right_gain;
        let send = if ctx.reverb_send > 0.0 {
            mono * gain * ctx.reverb_send
        } else {
            0.0
        };

        (out_l, out_r, send)
    }

    fn advance_position(&mut self, rate: f64, sample: &Sample) {
        let inc = Fixed::from_f32(rate as f32);
        self.position += inc;

        if sample.is_looped() && !self.flags.disable_looping {
            if self.position.frame_part() >= sample.loop_end {
                let overshoot = self.position.frame_part() - sample.loop_end;
                self.position = Fixed::from_frame(sample.loop_start + overshoot);
            }
        } else if self.position.frame_part() >= sample.frame_count {
            self.mark_sample_ended();
        }
    }

    fn mark_sample_ended(&mut self) {
        match self.state {
            VoiceState::Attacking | VoiceState::Decaying | VoiceState::Sustaining => {
                self.state = VoiceState::Terminating;
            }
            _ => {}
        }
    }

    fn track_envelope_health(&mut self, env: &Envelope) {
        if env.mode() == EnvelopeMode::Running {
            self.malformed_env_ticks += 1;
            if self.malformed_env_ticks > MAX_ENV_FAIL_TICKS {
                self.state = VoiceState::Terminating;
            }
        } else {
            self.malformed_env_ticks = 0;
        }
    }

    fn update_state_from_envelope(&mut self) {
        let Some(env) = &self.volume_env else {
            return;
        };
        match (self.state, env.mode()) {
            (VoiceState::Attacking, EnvelopeMode::Running) => {
                self.state = VoiceState::Decaying;
            }
            (VoiceState::Attacking, EnvelopeMode::SustainHeld)
            | (VoiceState::Decaying, EnvelopeMode::SustainHeld) => {
                self.state = VoiceState::Sustaining;
            }
            (_, EnvelopeMode::Terminated) => {
                if self.state != VoiceState::Idle {
                    self.state = VoiceState::Terminating;
                }
            }
            _ => {}
        }

        if self.state == VoiceState::Terminating {
            self.retire();
        }
    }
}

fn filter_cents_env_to_hz(cents: f32) -> f32 {
    // Linear cents-to-Hz offset approximation; exact octave scaling
    // isn't required for a filter-cutoff modulation source.
    cents * 2.0
}

mod ordered_float {
    #[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
    pub struct NotNanOrd(pub f32);

    impl Eq for NotNanOrd {}
    impl Ord for NotNanOrd {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

pub struct VoicePool {
    voices: Vec<Voice>,
    next_seq: u64,
}

impl VoicePool {
    pub fn new(count: usize, sample_rate_out: u32) -> Self {
        Self {
            voices: (0..count).map(|_| Voice::new(sample_rate_out)).collect(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn find_bound(&mut self, owner: VoiceOwner, note: u8) -> Option<&mut Voice> {
        self.voices
            .iter_mut()
            .find(|v| v.owner() == Some(owner) && v.note() == note && !v.is_idle())
    }

    /// Allocates (stealing if necessary) a voice for a new note-on.
    pub fn allocate(
        &mut self,
        owner: VoiceOwner,
        note: u8,
        velocity: u8,
        instrument: &ResolvedInstrument,
    ) -> &mut Voice {
        self.next_seq += 1;
        let seq = self.next_seq;

        if instrument.flags.mono_voice_only {
            if let Some(idx) = self
                .voices
                .iter()
                .position(|v| v.owner() == Some(owner) && v.note() == note && !v.is_idle())
            {
                self.voices[idx].retrigger(velocity, seq);
                return &mut self.voices[idx];
            }
        }

        if let Some(idx) = self.voices.iter().position(|v| v.is_idle()) {
            self.voices[idx].bind(owner, note, velocity, instrument, seq);
            return &mut self.voices[idx];
        }

        let steal_idx = self
            .voices
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.steal_score())
            .map(|(i, _)| i)
            .expect("voice pool is never empty");

        self.voices[steal_idx].force_steal();
        self.voices[steal_idx].bind(owner, note, velocity, instrument, seq);
        &mut self.voices[steal_idx]
    }

    pub fn terminate_owner(&mut self, owner: VoiceOwner) {
        for v in &mut self.voices {
            if v.owner() == Some(owner) {
                v.retire_now();
            }
        }
    }

    pub fn release_channel(&mut self, song: SongId, channel: u8) {
        for v in &mut self.voices {
            if v.owner() == Some(VoiceOwner::Song { song, channel }) {
                v.note_off();
            }
        }
    }
}

impl Voice {
    /// Immediate force-termination, used by `CC120 All-Sound-Off`,
    /// Song/Sound deletion, and bank unload.
    pub fn retire_now(&mut self) {
        self.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::{AdsrDescriptor, SampleData};

    fn test_instrument() -> ResolvedInstrument {
        ResolvedInstrument {
            sample: Arc::new(Sample {
                pcm: SampleData::Mono16(vec![10_000; 4096]),
                frame_count: 4096,
                native_sample_rate: 44100,
                root_pitch: 60,
                fine_tune_cents: 0,
                loop_start: 0,
                loop_end: 4096,
            }),
            root_pitch: 60,
            volume_adsr: crate::bank::descriptor_to_ticks(&AdsrDescriptor::flat_sustain(), 44100),
            pitch_adsr: None,
            filter_adsr: None,
            lfos: vec![],
            filter: None,
            pan: 0,
            flags: InstrumentFlags::default(),
        }
    }

    #[test]
    fn voice_pool_allocates_idle_before_stealing() {
        let mut pool = VoicePool::new(2, 44100);
        let inst = test_instrument();
        let owner = VoiceOwner::Song {
            song: SongId(0),
            channel: 0,
        };
        pool.allocate(owner, 60, 100, &inst);
        pool.allocate(owner, 62, 100, &inst);
        assert!(pool.voices().iter().all(|v| !v.is_idle()));
    }

    #[test]
    fn stealing_keeps_pool_size_bounded() {
        let mut pool = VoicePool::new(4, 44100);
        let inst = test_instrument();
        let owner = VoiceOwner::Song {
            song: SongId(0),
            channel: 0,
        };
        for note in [60, 62, 64, 65, 67] {
            pool.allocate(owner, note, 100, &inst);
        }
        let active = pool.voices().iter().filter(|v| !v.is_idle()).count();
        assert!(active <= 4);
    }

    #[test]
    fn note_off_idempotent_no_panic() {
        let mut pool = VoicePool::new(1, 44100);
        let inst = test_instrument();
        let owner = VoiceOwner::Sound { sound: SoundId(0) };
        pool.allocate(owner, 60, 100, &inst);
        pool.voices_mut()[0].note_off();
        pool.voices_mut()[0].note_off();
    }
}
