//! "Classic" reverb family: one Freeverb-style comb+allpass network,
//! table-driven by [`ClassicPreset`].

const COMB_TUNINGS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNINGS: [usize; 4] = [556, 441, 341, 225];
const STEREO_SPREAD: usize = 23;
const FIXED_GAIN: f32 = 0.015;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassicPreset {
    Closet,
    Garage,
    AcousticLab,
    Cavern,
    Dungeon,
    SmallReflections,
    EarlyReflections,
    Basement,
    BanquetHall,
    Catacombs,
}

impl ClassicPreset {
    /// (room_size, damping, wet_gain)
    fn params(&self) -> (f32, f32, f32) {
        match self {
            ClassicPreset::Closet => (0.1, 0.2, 0.15),
            ClassicPreset::Garage => (0.25, 0.3, 0.2),
            ClassicPreset::AcousticLab => (0.4, 0.25, 0.25),
            ClassicPreset::Cavern => (0.8, 0.5, 0.4),
            ClassicPreset::Dungeon => (0.7, 0.6, 0.35),
            ClassicPreset::SmallReflections => (0.15, 0.15, 0.1),
            ClassicPreset::EarlyReflections => (0.2, 0.1, 0.12),
            ClassicPreset::Basement => (0.5, 0.45, 0.3),
            ClassicPreset::BanquetHall => (0.65, 0.35, 0.35),
            ClassicPreset::Catacombs => (0.9, 0.55, 0.45),
        }
    }
}

struct CombFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damping: f32,
    filter_state: f32,
}

impl CombFilter {
    fn new(size: usize, feedback: f32, damping: f32) -> Self {
        Self {
            buffer: vec![0.0; size],
            index: 0,
            feedback,
            damping,
            filter_state: 0.0,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.index];
        self.filter_state = output * (1.0 - self.damping) + self.filter_state * self.damping;
        self.buffer[self.index] = input + self.filter_state * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.filter_state = 0.0;
    }
}

struct AllpassFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
}

impl AllpassFilter {
    fn new(size: usize, feedback: f32) -> Self {
        Self {
            buffer: vec![0.0; size],
            index: 0,
            feedback,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.index];
        let output = -input + buffered;
        self.buffer[self.index] = input + buffered * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
    }
}

pub struct ClassicReverb {
    combs_l: Vec<CombFilter>,
    combs_r: Vec<CombFilter>,
    allpass_l: Vec<AllpassFilter>,
    allpass_r: Vec<AllpassFilter>,
    wet_gain: f32,
}

impl ClassicReverb {
    pub fn new(sample_rate: u32, preset: ClassicPreset) -> Self {
        let (room_size, damping, wet_gain) = preset.params();
        let feedback = 0.28 + room_size * 0.7;
        let scale = sample_rate as f64 / 44100.0;

        let combs_l = COMB_TUNINGS
            .iter()
            .map(|&t| CombFilter::new(((t as f64 * scale) as usize).max(1), feedback, damping))
            .collect();
        let combs_r = COMB_TUNINGS
            .iter()
            .map(|&t| {
                CombFilter::new(
                    (((t + STEREO_SPREAD) as f64 * scale) as usize).max(1),
                    feedback,
                    damping,
                )
            })
            .collect();
        let allpass_l = ALLPASS_TUNINGS
            .iter()
            .map(|&t| AllpassFilter::new(((t as f64 * scale) as usize).max(1), 0.5))
            .collect();
        let allpass_r = ALLPASS_TUNINGS
            .iter()
            .map(|&t| {
                AllpassFilter::new(
                    (((t + STEREO_SPREAD) as f64 * scale) as usize).max(1),
                    0.5,
                )
            })
            .collect();

        Self {
            combs_l,
            combs_r,
            allpass_l,
            allpass_r,
            wet_gain,
        }
    }

    pub fn process(&mut self, input: f32) -> (f32, f32) {
        let scaled = input * FIXED_GAIN;
        let mut out_l: f32 = self.combs_l.iter_mut().map(|c| c.process(scaled)).sum();
        let mut out_r: f32 = self.combs_r.iter_mut().map(|c| c.process(scaled)).sum();

        for ap in &mut self.allpass_l {
            out_l = ap.process(out_l);
        }
        for ap in &mut self.allpass_r {
            out_r = ap.process(out_r);
        }

        (out_l * self.wet_gain, out_r * self.wet_gain)
    }

    pub fn clear(&mut self) {
        for c in self.combs_l.iter_mut().chain(self.combs_r.iter_mut()) {
            c.clear();
        }
        for a in self.allpass_l.iter_mut().chain(self.allpass_r.iter_mut()) {
            a.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_in_converges_to_silence_out() {
        let mut reverb = ClassicReverb::new(44100, ClassicPreset::Cavern);
        // Prime with one loud impulse, then feed silence.
        reverb.process(1.0);
        for _ in 0..200_000 {
            reverb.process(0.0);
        }
        let (l, r) = reverb.process(0.0);
        assert!(l.abs() < 1e-4);
        assert!(r.abs() < 1e-4);
    }
}
