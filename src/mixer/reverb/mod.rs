//! Master Bus reverb: a single shared unit fed by every voice's and
//! Sound's reverb send, selectable between "Classic" (Freeverb-style)
//! and "Neo" (MT-32-style) families, or disabled.

mod classic;
mod neo;

pub use classic::ClassicPreset;
pub use neo::NeoPreset;

use classic::ClassicReverb;
use neo::NeoReverb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverbType {
    None,
    Classic(ClassicPreset),
    Neo(NeoPreset),
    /// A Neo comb-bank tuned from a loaded [`CustomPreset`] rather than
    /// a built-in table entry.
    NeoCustom,
}

/// Integer-only reverb parameters a `CustomPreset` carries, so a
/// save/load round trip never drifts from float rounding. All per-comb
/// arrays are indexed in parallel; only the first `comb_count` entries
/// of each are meaningful. `feedback_midi`/`gain_midi`/`lowpass_midi`/
/// `wet_mix_midi` are 0..=127 MIDI-style values, converted to actual
/// gain/coefficient units when the comb bank is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomPreset {
    pub delay_ms: [u32; neo::MAX_NEO_COMBS],
    pub feedback_midi: [u32; neo::MAX_NEO_COMBS],
    pub gain_midi: [u32; neo::MAX_NEO_COMBS],
    pub lowpass_midi: u32,
    pub wet_mix_midi: u32,
    pub comb_count: u8,
}

impl Default for CustomPreset {
    fn default() -> Self {
        Self {
            delay_ms: [30, 45, 60, 75],
            feedback_midi: [70, 70, 70, 70],
            gain_midi: [127, 127, 127, 127],
            lowpass_midi: 127,
            wet_mix_midi: 100,
            comb_count: 4,
        }
    }
}

impl CustomPreset {
    pub fn to_xml(&self) -> String {
        let n = self.comb_count as usize;
        let delays = join_tags(&self.delay_ms[..n.min(neo::MAX_NEO_COMBS)], "delay");
        let feedbacks = join_tags(&self.feedback_midi[..n.min(neo::MAX_NEO_COMBS)], "feedback");
        let gains = join_tags(&self.gain_midi[..n.min(neo::MAX_NEO_COMBS)], "gain");
        format!(
            "<reverb-preset><comb-count>{}</comb-count><lowpass-midi>{}</lowpass-midi><wet-mix-midi>{}</wet-mix-midi><delays>{delays}</delays><feedbacks>{feedbacks}</feedbacks><gains>{gains}</gains></reverb-preset>",
            self.comb_count, self.lowpass_midi, self.wet_mix_midi
        )
    }

    pub fn from_xml(xml: &str) -> Option<Self> {
        let comb_count = extract_tag(xml, "comb-count")?.parse().ok()?;
        let lowpass_midi = extract_tag(xml, "lowpass-midi")?.parse().ok()?;
        let wet_mix_midi = extract_tag(xml, "wet-mix-midi")?.parse().ok()?;
        let delay_ms = parse_tag_array(extract_tag(xml, "delays")?, "delay")?;
        let feedback_midi = parse_tag_array(extract_tag(xml, "feedbacks")?, "feedback")?;
        let gain_midi = parse_tag_array(extract_tag(xml, "gains")?, "gain")?;
        Some(Self {
            delay_ms,
            feedback_midi,
            gain_midi,
            lowpass_midi,
            wet_mix_midi,
            comb_count,
        })
    }
}

fn join_tags(values: &[u32], tag: &str) -> String {
    let mut out = String::new();
    for v in values {
        out.push_str(&format!("<{tag}>{v}</{tag}>"));
    }
    out
}

fn parse_tag_array(section: &str, tag: &str) -> Option<[u32; neo::MAX_NEO_COMBS]> {
    let mut out = [0u32; neo::MAX_NEO_COMBS];
    for (slot, value) in out.iter_mut().zip(extract_all_tags(section, tag)) {
        *slot = value.parse().ok()?;
    }
    Some(out)
}

fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

fn extract_all_tags<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start_rel) = rest.find(&open) {
        let start = start_rel + open.len();
        let Some(end_rel) = rest[start..].find(&close) else {
            break;
        };
        let end = start + end_rel;
        out.push(&rest[start..end]);
        rest = &rest[end + close.len()..];
    }
    out
}

enum Backend {
    None,
    Classic(ClassicReverb),
    Neo(NeoReverb),
}

/// The Master Bus's single reverb unit. Rebuilds its backend lazily,
/// on the next `process_block`, whenever the reverb type is changed
/// mid-stream — never inside the audio callback's hot per-sample path.
pub struct ReverbUnit {
    sample_rate: u32,
    reverb_type: ReverbType,
    custom: CustomPreset,
    backend: Backend,
    dirty: bool,
}

impl ReverbUnit {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            reverb_type: ReverbType::None,
            custom: CustomPreset::default(),
            backend: Backend::None,
            dirty: false,
        }
    }

    pub fn set_type(&mut self, reverb_type: ReverbType) {
        if reverb_type != self.reverb_type {
            self.reverb_type = reverb_type;
            self.dirty = true;
        }
    }

    pub fn set_custom_preset(&mut self, preset: CustomPreset) {
        self.custom = preset;
        self.mark_custom_dirty();
    }

    pub fn set_comb_count(&mut self, count: u8) {
        self.custom.comb_count = count.min(neo::MAX_NEO_COMBS as u8);
        self.mark_custom_dirty();
    }

    pub fn set_comb_delay_ms(&mut self, index: usize, delay_ms: u32) {
        if let Some(slot) = self.custom.delay_ms.get_mut(index) {
            *slot = delay_ms;
            self.mark_custom_dirty();
        }
    }

    pub fn set_comb_feedback_midi(&mut self, index: usize, feedback_midi: u32) {
        if let Some(slot) = self.custom.feedback_midi.get_mut(index) {
            *slot = feedback_midi.min(127);
            self.mark_custom_dirty();
        }
    }

    pub fn set_comb_gain_midi(&mut self, index: usize, gain_midi: u32) {
        if let Some(slot) = self.custom.gain_midi.get_mut(index) {
            *slot = gain_midi.min(127);
            self.mark_custom_dirty();
        }
    }

    pub fn set_lowpass_midi(&mut self, lowpass_midi: u32) {
        self.custom.lowpass_midi = lowpass_midi.min(127);
        self.mark_custom_dirty();
    }

    pub fn set_wet_mix_midi(&mut self, wet_mix_midi: u32) {
        self.custom.wet_mix_midi = wet_mix_midi.min(127);
        self.mark_custom_dirty();
    }

    fn mark_custom_dirty(&mut self) {
        if self.reverb_type == ReverbType::NeoCustom {
            self.dirty = true;
        }
    }

    pub fn reverb_type(&self) -> ReverbType {
        self.reverb_type
    }

    fn rebuild_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.backend = match self.reverb_type {
            ReverbType::None => Backend::None,
            ReverbType::Classic(preset) => Backend::Classic(ClassicReverb::new(self.sample_rate, preset)),
            ReverbType::Neo(preset) => Backend::Neo(NeoReverb::new(self.sample_rate, preset)),
            ReverbType::NeoCustom => Backend::Neo(neo::NeoReverb::new_custom(self.sample_rate, &self.custom)),
        };
        self.dirty = false;
    }

    /// Accumulates one frame's dry-mixed reverb send into a stereo wet
    /// pair, rebuilding the backend first if the type just changed.
    pub fn process(&mut self, send: i32) -> (i32, i32) {
        self.rebuild_if_dirty();
        match &mut self.backend {
            Backend::None => (0, 0),
            Backend::Classic(r) => {
                let (l, r) = r.process(send as f32);
                (l as i32, r as i32)
            }
            Backend::Neo(r) => {
                let out = r.process(send);
                (out, out)
            }
        }
    }

    pub fn clear(&mut self) {
        match &mut self.backend {
            Backend::None => {}
            Backend::Classic(r) => r.clear(),
            Backend::Neo(r) => r.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_preset_xml_round_trips_exactly() {
        let preset = CustomPreset {
            delay_ms: [12, 34, 56, 78],
            feedback_midi: [60, 62, 64, 66],
            gain_midi: [100, 110, 120, 127],
            lowpass_midi: 90,
            wet_mix_midi: 80,
            comb_count: 3,
        };
        let xml = preset.to_xml();
        let parsed = CustomPreset::from_xml(&xml).expect("round trip should parse");
        assert_eq!(parsed.lowpass_midi, preset.lowpass_midi);
        assert_eq!(parsed.wet_mix_midi, preset.wet_mix_midi);
        assert_eq!(parsed.comb_count, preset.comb_count);
        assert_eq!(&parsed.delay_ms[..3], &preset.delay_ms[..3]);
        assert_eq!(&parsed.feedback_midi[..3], &preset.feedback_midi[..3]);
        assert_eq!(&parsed.gain_midi[..3], &preset.gain_midi[..3]);
    }

    #[test]
    fn comb_setters_mark_custom_dirty_only_when_active() {
        let mut unit = ReverbUnit::new(44100);
        unit.set_comb_gain_midi(0, 100);
        assert!(!unit.dirty, "inactive custom type should not trigger a rebuild");
        unit.set_type(ReverbType::NeoCustom);
        unit.process(0);
        unit.set_wet_mix_midi(64);
        assert!(unit.dirty);
    }

    #[test]
    fn switching_type_defers_rebuild_until_next_process() {
        let mut unit = ReverbUnit::new(44100);
        unit.set_type(ReverbType::Classic(ClassicPreset::Cavern));
        assert!(unit.dirty);
        unit.process(0);
        assert!(!unit.dirty);
    }

    #[test]
    fn none_type_passes_silence() {
        let mut unit = ReverbUnit::new(44100);
        assert_eq!(unit.process(30_000), (0, 0));
    }
}
