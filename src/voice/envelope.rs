//! Runtime ADSR envelope: walks a bank's [`TickAdsr`](crate::bank::TickAdsr)
//! stage list one tick at a time. Generalizes the fixed four-stage
//! attack/decay/sustain/release shape into up to `ADSR_STAGES` flagged
//! stages.

use crate::bank::{StageFlag, TickAdsr, TickAdsrStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeMode {
    Running,
    SustainHeld,
    Releasing,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    stages: TickAdsr,
    stage_index: usize,
    current_level: f32,
    stage_start_level: f32,
    ticks_in_stage: u32,
    mode: EnvelopeMode,
}

impl Envelope {
    pub fn new(stages: TickAdsr) -> Self {
        Self {
            stages,
            stage_index: 0,
            current_level: 0.0,
            stage_start_level: 0.0,
            ticks_in_stage: 0,
            mode: EnvelopeMode::Running,
        }
    }

    pub fn mode(&self) -> EnvelopeMode {
        self.mode
    }

    /// Rewinds to the first stage without resetting amplitude, for a
    /// mono-voice-only retrigger: the new note's attack ramps from the
    /// still-sounding voice's current level rather than from silence.
    pub fn restart_from_current_level(&mut self, stages: TickAdsr) {
        self.stages = stages;
        self.stage_index = 0;
        self.stage_start_level = self.current_level;
        self.ticks_in_stage = 0;
        self.mode = EnvelopeMode::Running;
    }

    pub fn level(&self) -> f32 {
        self.current_level
    }

    fn current_stage(&self) -> Option<&TickAdsrStage> {
        self.stages.stages.get(self.stage_index)
    }

    /// Advances the envelope by one output frame, returning the new
    /// level normalized to `0.0..=1.0` of `VOLUME_RANGE`.
    pub fn advance(&mut self) -> f32 {
        if self.mode == EnvelopeMode::Terminated || self.mode == EnvelopeMode::SustainHeld {
            return self.current_level;
        }

        let stage = match self.current_stage() {
            Some(s) => *s,
            None => {
                self.mode = EnvelopeMode::Terminated;
                self.current_level = 0.0;
                return 0.0;
            }
        };

        let target = stage.target_level as f32 / crate::bank::VOLUME_RANGE as f32;
        let duration = stage.duration_ticks.max(1) as f32;
        let progress = (self.ticks_in_stage as f32 / duration).min(1.0);
        self.current_level = self.stage_start_level + (target - self.stage_start_level) * progress;

        self.ticks_in_stage += 1;
        if self.ticks_in_stage >= stage.duration_ticks {
            self.enter_next_stage(stage, target);
        }

        self.current_level
    }

    fn enter_next_stage(&mut self, finished_stage: TickAdsrStage, target: f32) {
        match finished_stage.flag {
            StageFlag::SustainUntilNoteOff => {
                self.mode = EnvelopeMode::SustainHeld;
                self.current_level = target;
            }
            StageFlag::Terminate => {
                self.mode = EnvelopeMode::Terminated;
                self.current_level = 0.0;
            }
            StageFlag::LinearRamp | StageFlag::Release => {
                self.stage_start_level = target;
                self.ticks_in_stage = 0;
                self.stage_index += 1;
                if self.stage_index >= self.stages.stages.len() {
                    self.mode = EnvelopeMode::Terminated;
                    self.current_level = 0.0;
                }
            }
        }
    }

    /// Note-off: if currently sustaining, or anywhere before the
    /// release stage, jump straight to the first `Release`-flagged
    /// stage, carrying over the current level as the ramp's start.
    pub fn note_off(&mut self) {
        if self.mode == EnvelopeMode::Terminated {
            return;
        }
        if let Some(release_idx) = self
            .stages
            .stages
            .iter()
            .position(|s| s.flag == StageFlag::Release)
        {
            self.stage_index = release_idx;
            self.stage_start_level = self.current_level;
            self.ticks_in_stage = 0;
            self.mode = EnvelopeMode::Releasing;
        } else {
            // Malformed envelope with no release stage: terminate
            // immediately rather than sustain forever.
            self.mode = EnvelopeMode::Terminated;
            self.current_level = 0.0;
        }
    }

    /// Forces a fast 5ms linear release to zero, used when a voice is
    /// stolen.
    pub fn force_steal_release(&mut self, ticks: u32) {
        self.stages = TickAdsr {
            stages: vec![TickAdsrStage {
                target_level: 0,
                duration_ticks: ticks.max(1),
                flag: StageFlag::Terminate,
            }],
        };
        self.stage_index = 0;
        self.stage_start_level = self.current_level;
        self.ticks_in_stage = 0;
        self.mode = EnvelopeMode::Releasing;
    }

    pub fn is_terminated(&self) -> bool {
        self.mode == EnvelopeMode::Terminated
    }

    pub fn is_releasing(&self) -> bool {
        self.mode == EnvelopeMode::Releasing
    }

    pub fn is_sustaining(&self) -> bool {
        self.mode == EnvelopeMode::SustainHeld
    }

    pub fn stages_clone(&self) -> TickAdsr {
        self.stages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::AdsrDescriptor;

    fn ticks(desc: AdsrDescriptor) -> TickAdsr {
        TickAdsr {
            stages: desc
                .stages
                .iter()
                .map(|s| TickAdsrStage {
                    target_level: s.target_level,
                    duration_ticks: crate::fixed::usec_to_ticks(s.duration_us, 44100),
                    flag: s.flag,
                })
                .collect(),
        }
    }

    #[test]
    fn reaches_sustain_and_holds() {
        let mut env = Envelope::new(ticks(AdsrDescriptor::flat_sustain()));
        for _ in 0..5 {
            env.advance();
        }
        assert!(env.is_sustaining());
    }

    #[test]
    fn note_off_then_terminate() {
        let mut env = Envelope::new(ticks(AdsrDescriptor::flat_sustain()));
        for _ in 0..5 {
            env.advance();
        }
        env.note_off();
        assert!(env.is_releasing());
        for _ in 0..10 {
            env.advance();
        }
        assert!(env.is_terminated());
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn second_note_off_is_idempotent() {
        let mut env = Envelope::new(ticks(AdsrDescriptor::flat_sustain()));
        env.advance();
        env.note_off();
        let level_after_first = env.level();
        env.note_off();
        assert_eq!(env.level(), level_after_first);
    }
}
