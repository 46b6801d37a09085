//! Velocity-to-ADSR-peak curves. Selection affects new note-ons only;
//! already-playing voices are not retrobuilt.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocityCurve {
    MiniBaeS,
    PeakyS,
    WebTv,
    ExponentialDouble,
    LinearDouble,
}

impl VelocityCurve {
    pub fn from_index(idx: u8) -> Self {
        match idx {
            0 => VelocityCurve::MiniBaeS,
            1 => VelocityCurve::PeakyS,
            2 => VelocityCurve::WebTv,
            3 => VelocityCurve::ExponentialDouble,
            _ => VelocityCurve::LinearDouble,
        }
    }

    /// Maps MIDI velocity 0..127 onto the attack stage's target level,
    /// 0..`VOLUME_RANGE`. Monotonically non-decreasing, `curve(0) == 0`
    /// and `curve(127) == VOLUME_RANGE` for every variant.
    pub fn apply(&self, velocity: u8) -> i32 {
        let v = velocity.min(127) as f32 / 127.0;
        let shaped = match self {
            VelocityCurve::MiniBaeS => s_curve(v, 2.0),
            VelocityCurve::PeakyS => s_curve(v, 4.0),
            VelocityCurve::WebTv => v.powf(0.6),
            VelocityCurve::ExponentialDouble => v * v,
            VelocityCurve::LinearDouble => v,
        };
        (shaped.clamp(0.0, 1.0) * crate::bank::VOLUME_RANGE as f32).round() as i32
    }
}

/// A smoothstep-family S curve parameterized by steepness; monotone on
/// `[0, 1]` for any `steepness >= 1`.
fn s_curve(x: f32, steepness: f32) -> f32 {
    let x = x.clamp(0.0, 1.0);
    x.powf(steepness) / (x.powf(steepness) + (1.0 - x).powf(steepness)).max(1e-6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_match_for_every_curve() {
        for curve in [
            VelocityCurve::MiniBaeS,
            VelocityCurve::PeakyS,
            VelocityCurve::WebTv,
            VelocityCurve::ExponentialDouble,
            VelocityCurve::LinearDouble,
        ] {
            assert_eq!(curve.apply(0), 0, "{curve:?} curve(0) != 0");
            assert_eq!(curve.apply(127), crate::bank::VOLUME_RANGE, "{curve:?} curve(127) != max");
        }
    }

    #[test]
    fn monotonic_non_decreasing() {
        for curve in [
            VelocityCurve::MiniBaeS,
            VelocityCurve::PeakyS,
            VelocityCurve::WebTv,
            VelocityCurve::ExponentialDouble,
            VelocityCurve::LinearDouble,
        ] {
            let mut last = -1;
            for v in 0..=127u8 {
                let level = curve.apply(v);
                assert!(level >= last, "{curve:?} not monotonic at velocity {v}");
                last = level;
            }
        }
    }
}
