//! "Neo" MT-32-style reverb family, grounded in the tap-delay and
//! parallel-comb backends of the original engine's GenReverbNeo unit.
//! Operates in Q16.16 fixed point to match the reference engine's
//! truncation/denormal behavior exactly, rather than float approximation.

use crate::fixed::Fixed;

pub const NEO_TAP_COUNT: usize = 4;
const NEO_TAP_DELAYS_FRAMES: [usize; NEO_TAP_COUNT] = [4410, 8820, 13230, 17640];
const NEO_TAP_GAINS: [f32; NEO_TAP_COUNT] = [1.0, 0.8, 0.6, 0.4];

pub const MAX_NEO_COMBS: usize = 4;
const NEO_FEEDBACK_CEILING: f32 = 0.85;
const NEO_SILENCE_THRESHOLD: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeoPreset {
    Room,
    Hall,
    Cavern,
    Dungeon,
    TapDelay,
}

/// Tap-delay backend: a single delay line, read at `NEO_TAP_COUNT`
/// fixed offsets scaled to the output sample rate and summed with
/// per-tap gain.
pub struct NeoTapDelay {
    buffer: Vec<i32>,
    write_index: usize,
    tap_offsets: [usize; NEO_TAP_COUNT],
    tap_gains: [f32; NEO_TAP_COUNT],
}

impl NeoTapDelay {
    pub fn new(sample_rate: u32) -> Self {
        let scale = sample_rate as f64 / 44100.0;
        let tap_offsets = NEO_TAP_DELAYS_FRAMES.map(|d| ((d as f64 * scale) as usize).max(1));
        let longest = *tap_offsets.iter().max().unwrap();
        Self {
            buffer: vec![0; longest + 1],
            write_index: 0,
            tap_offsets,
            tap_gains: NEO_TAP_GAINS,
        }
    }

    pub fn process(&mut self, input: i32) -> i32 {
        let len = self.buffer.len();
        self.buffer[self.write_index] = input;

        let mut acc = 0i64;
        for (offset, gain) in self.tap_offsets.iter().zip(self.tap_gains.iter()) {
            let idx = (self.write_index + len - (offset % len)) % len;
            acc += (self.buffer[idx] as f64 * *gain as f64) as i64;
        }
        self.write_index = (self.write_index + 1) % len;

        let out = (acc / NEO_TAP_COUNT as i64) as i32;
        if out.abs() < NEO_SILENCE_THRESHOLD {
            0
        } else {
            out
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0);
    }
}

/// Scales a 0..=127 MIDI-style control value to a `0.0..=1.0` gain.
fn midi_to_unit(value: u32) -> f32 {
    value.min(127) as f32 / 127.0
}

struct NeoComb {
    buffer: Vec<i32>,
    index: usize,
    feedback: Fixed,
    gain: f32,
}

impl NeoComb {
    fn new(size: usize, feedback: f32, gain: f32) -> Self {
        Self {
            buffer: vec![0; size.max(1)],
            index: 0,
            feedback: Fixed::from_f32(feedback).clamp_feedback(Fixed::from_f32(NEO_FEEDBACK_CEILING)),
            gain,
        }
    }

    /// Writes `input + delayed * feedback` back into the line and
    /// contributes `delayed * gain` to the output accumulator.
    fn process(&mut self, input: i32) -> i32 {
        let len = self.buffer.len();
        let stored = self.buffer[self.index];
        let fed_back = Fixed(self.feedback.mul(Fixed(stored)).0).denormal_kill(NEO_SILENCE_THRESHOLD);
        self.buffer[self.index] = input.saturating_add(fed_back.0);
        self.index = (self.index + 1) % len;
        (stored as f64 * self.gain as f64) as i32
    }

    fn clear(&mut self) {
        self.buffer.fill(0);
    }
}

/// Parallel-comb backend: up to [`MAX_NEO_COMBS`] integer comb filters
/// summed and averaged, each with a feedback coefficient clamped below
/// [`NEO_FEEDBACK_CEILING`] and a denormal killer on the feedback path
/// so quiet tails truncate to exact silence instead of decaying forever.
/// The average then passes through a one-pole damping filter and a wet
/// mix gain before leaving the bank.
pub struct NeoCombBank {
    combs: Vec<NeoComb>,
    lowpass_state: i32,
    lowpass_coeff: f32,
    wet_mix: f32,
}

impl NeoCombBank {
    pub fn new(sample_rate: u32, preset: NeoPreset) -> Self {
        let (delays_ms, feedback): (&[f32], f32) = match preset {
            NeoPreset::Room => (&[29.7, 37.1, 41.1, 43.7], 0.55),
            NeoPreset::Hall => (&[50.3, 61.7, 68.9, 73.3], 0.7),
            NeoPreset::Cavern => (&[71.3, 88.1, 97.7, 103.9], 0.82),
            NeoPreset::Dungeon => (&[60.1, 70.3, 79.9, 89.3], 0.78),
            NeoPreset::TapDelay => (&[100.0], 0.0),
        };
        let combs = delays_ms
            .iter()
            .take(MAX_NEO_COMBS)
            .map(|ms| {
                let frames = ((*ms as f64 / 1000.0) * sample_rate as f64) as usize;
                NeoComb::new(frames, feedback, 1.0)
            })
            .collect();
        Self {
            combs,
            lowpass_state: 0,
            lowpass_coeff: 1.0,
            wet_mix: 1.0,
        }
    }

    /// Builds a comb bank from user-settable parameters instead of a
    /// built-in preset table entry.
    pub fn new_custom(sample_rate: u32, preset: &super::CustomPreset) -> Self {
        let count = (preset.comb_count as usize).min(MAX_NEO_COMBS).max(1);
        let combs = (0..count)
            .map(|i| {
                let frames = ((preset.delay_ms[i] as f64 / 1000.0) * sample_rate as f64) as usize;
                let feedback = midi_to_unit(preset.feedback_midi[i]) * NEO_FEEDBACK_CEILING;
                let gain = midi_to_unit(preset.gain_midi[i]);
                NeoComb::new(frames, feedback, gain)
            })
            .collect();
        Self {
            combs,
            lowpass_state: 0,
            lowpass_coeff: midi_to_unit(preset.lowpass_midi),
            wet_mix: midi_to_unit(preset.wet_mix_midi),
        }
    }

    pub fn process(&mut self, input: i32) -> i32 {
        if self.combs.is_empty() {
            return 0;
        }
        let sum: i64 = self.combs.iter_mut().map(|c| c.process(input) as i64).sum();
        let averaged = (sum / self.combs.len() as i64) as i32;
        self.lowpass_state += ((averaged - self.lowpass_state) as f64 * self.lowpass_coeff as f64) as i32;
        (self.lowpass_state as f64 * self.wet_mix as f64) as i32
    }

    pub fn clear(&mut self) {
        for c in &mut self.combs {
            c.clear();
        }
        self.lowpass_state = 0;
    }
}

pub enum NeoReverb {
    Tap(NeoTapDelay),
    Comb(NeoCombBank),
}

impl NeoReverb {
    pub fn new(sample_rate: u32, preset: NeoPreset) -> Self {
        match preset {
            NeoPreset::TapDelay => NeoReverb::Tap(NeoTapDelay::new(sample_rate)),
            other => NeoReverb::Comb(NeoCombBank::new(sample_rate, other)),
        }
    }

    pub fn new_custom(sample_rate: u32, preset: &super::CustomPreset) -> Self {
        NeoReverb::Comb(NeoCombBank::new_custom(sample_rate, preset))
    }

    pub fn process(&mut self, input: i32) -> i32 {
        match self {
            NeoReverb::Tap(t) => t.process(input),
            NeoReverb::Comb(c) => c.process(input),
        }
    }

    pub fn clear(&mut self) {
        match self {
            NeoReverb::Tap(t) => t.clear(),
            NeoReverb::Comb(c) => c.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_delay_echoes_impulse_at_first_tap() {
        let mut tap = NeoTapDelay::new(44100);
        tap.process(10_000);
        for _ in 0..4409 {
            tap.process(0);
        }
        let out = tap.process(0);
        assert!(out.abs() > NEO_SILENCE_THRESHOLD);
    }

    #[test]
    fn comb_feedback_never_exceeds_ceiling() {
        let bank = NeoCombBank::new(44100, NeoPreset::Cavern);
        for comb in &bank.combs {
            assert!(comb.feedback.to_f32() <= NEO_FEEDBACK_CEILING + 1e-6);
        }
    }

    #[test]
    fn comb_tail_eventually_truncates_to_exact_silence() {
        let mut bank = NeoCombBank::new(44100, NeoPreset::Dungeon);
        bank.process(20_000);
        let mut out = 1;
        for _ in 0..500_000 {
            out = bank.process(0);
        }
        assert_eq!(out, 0);
    }
}
