//! Sample Cache & Instrument Resolver.
//!
//! Owns decoded sample bytes and resolves `(bank_msb, bank_lsb, program,
//! note, velocity)` into a leaf `Instrument`. Never allocates on the
//! `resolve` path; loading is the only fallible, allocating operation.

pub mod dls;
pub mod native;
pub mod sf2;

use crate::error::{EngineError, EngineResult};
use crate::fixed::usec_to_ticks;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

pub const MAX_LFOS: usize = 4;
pub const ADSR_STAGES: usize = 8;
pub const VOLUME_RANGE: i32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankToken(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlag {
    LinearRamp,
    SustainUntilNoteOff,
    Release,
    Terminate,
}

/// One declared ADSR stage, in bank-authored microseconds. Converted to
/// engine ticks at resolve time.
#[derive(Debug, Clone, Copy)]
pub struct AdsrStage {
    pub target_level: i32,
    pub duration_us: u32,
    pub flag: StageFlag,
}

#[derive(Debug, Clone, Default)]
pub struct AdsrDescriptor {
    pub stages: Vec<AdsrStage>,
}

impl AdsrDescriptor {
    /// A flat envelope: full scale immediately, held until note-off,
    /// instant release. Used as a safe fallback when a bank omits an
    /// envelope the resolver needs (e.g. a pitch ADSR the instrument
    /// doesn't declare but a caller asks for anyway).
    pub fn flat_sustain() -> Self {
        Self {
            stages: vec![
                AdsrStage {
                    target_level: VOLUME_RANGE,
                    duration_us: 1,
                    flag: StageFlag::SustainUntilNoteOff,
                },
                AdsrStage {
                    target_level: 0,
                    duration_us: 1,
                    flag: StageFlag::Terminate,
                },
            ],
        }
    }

    pub fn validate(&self) -> bool {
        !self.stages.is_empty()
            && self.stages.len() <= ADSR_STAGES
            && self
                .stages
                .iter()
                .any(|s| s.flag == StageFlag::SustainUntilNoteOff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoShape {
    Sine,
    Triangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoDestination {
    Pitch,
    Volume,
    FilterCutoff,
    StereoPan,
}

#[derive(Debug, Clone)]
pub struct LfoDescriptor {
    pub period_us: u32,
    pub shape: LfoShape,
    pub depth: i16,
    pub destination: LfoDestination,
    pub depth_envelope: Option<AdsrDescriptor>,
}

#[derive(Debug, Clone, Copy)]
pub struct FilterDescriptor {
    pub cutoff_hz: f32,
    pub resonance: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentFlags {
    pub disable_looping: bool,
    pub play_at_sample_rate: bool,
    pub mono_voice_only: bool,
}

#[derive(Debug)]
pub enum SampleData {
    Mono16(Vec<i16>),
    Stereo16(Vec<[i16; 2]>),
}

#[derive(Debug)]
pub struct Sample {
    pub pcm: SampleData,
    pub frame_count: u32,
    pub native_sample_rate: u32,
    pub root_pitch: u8,
    pub fine_tune_cents: i16,
    pub loop_start: u32,
    pub loop_end: u32,
}

impl Sample {
    pub fn is_looped(&self) -> bool {
        self.loop_end > self.loop_start
    }

    pub fn channels(&self) -> usize {
        match &self.pcm {
            SampleData::Mono16(_) => 1,
            SampleData::Stereo16(_) => 2,
        }
    }

    /// Reads frame `idx` as (left, right), duplicating mono to both
    /// channels. Out-of-range reads return silence — callers are
    /// expected to have already decided whether to loop or terminate.
    pub fn frame_at(&self, idx: u32) -> (i16, i16) {
        match &self.pcm {
            SampleData::Mono16(data) => {
                let s = data.get(idx as usize).copied().unwrap_or(0);
                (s, s)
            }
            SampleData::Stereo16(data) => {
                let f = data.get(idx as usize).copied().unwrap_or([0, 0]);
                (f[0], f[1])
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentLeaf {
    pub sample: Arc<Sample>,
    pub volume_adsr: AdsrDescriptor,
    pub pitch_adsr: Option<AdsrDescriptor>,
    pub filter_adsr: Option<AdsrDescriptor>,
    pub lfos: Vec<LfoDescriptor>,
    pub filter: Option<FilterDescriptor>,
    pub pan: i8,
    pub flags: InstrumentFlags,
}

#[derive(Debug, Clone)]
pub struct KeySplitRegion {
    pub key_low: u8,
    pub key_high: u8,
    pub child: Box<Instrument>,
}

#[derive(Debug, Clone)]
pub enum Instrument {
    Leaf(InstrumentLeaf),
    KeySplit(Vec<KeySplitRegion>),
}

impl Instrument {
    pub fn resolve_leaf(&self, note: u8) -> Option<&InstrumentLeaf> {
        match self {
            Instrument::Leaf(leaf) => Some(leaf),
            Instrument::KeySplit(regions) => regions
                .iter()
                .find(|r| note >= r.key_low && note <= r.key_high)
                .and_then(|r| r.child.resolve_leaf(note)),
        }
    }
}

/// A resolved leaf with its ADSR stages already converted to engine
/// ticks for the cache's configured sample rate. This is the type
/// `SampleCache::resolve` actually hands back, so voices never touch
/// microsecond-denominated stages.
#[derive(Debug, Clone)]
pub struct ResolvedInstrument {
    pub sample: Arc<Sample>,
    /// Base pitch a voice should treat the sample's un-shifted playback
    /// rate as corresponding to. Equal to `sample.root_pitch` except for
    /// percussion, where it's overridden to the triggering note so drums
    /// always play at the correct pitch regardless of the bank-declared
    /// root.
    pub root_pitch: u8,
    pub volume_adsr: TickAdsr,
    pub pitch_adsr: Option<TickAdsr>,
    pub filter_adsr: Option<TickAdsr>,
    pub lfos: Vec<LfoDescriptor>,
    pub filter: Option<FilterDescriptor>,
    pub pan: i8,
    pub flags: InstrumentFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct TickAdsrStage {
    pub target_level: i32,
    pub duration_ticks: u32,
    pub flag: StageFlag,
}

#[derive(Debug, Clone, Default)]
pub struct TickAdsr {
    pub stages: Vec<TickAdsrStage>,
}

pub fn descriptor_to_ticks(desc: &AdsrDescriptor, sample_rate: u32) -> TickAdsr {
    to_ticks(desc, sample_rate)
}

fn to_ticks(desc: &AdsrDescriptor, sample_rate: u32) -> TickAdsr {
    TickAdsr {
        stages: desc
            .stages
            .iter()
            .map(|s| TickAdsrStage {
                target_level: s.target_level,
                duration_ticks: usec_to_ticks(s.duration_us, sample_rate),
                flag: s.flag,
            })
            .collect(),
    }
}

struct Bank {
    instruments: HashMap<(u8, u8, u8), Instrument>,
}

/// Drum-kit bank-select conventions the resolver recognizes: DLS
/// percussion bank 120, SF2 percussion bank 127, or the legacy
/// native-format odd-bank percussion encoding.
fn is_percussion_bank(bank_msb: u8) -> bool {
    bank_msb == 120 || bank_msb == 127 || bank_msb % 2 == 1
}

pub struct SampleCache {
    sample_rate: u32,
    banks: HashMap<BankToken, Bank>,
    load_order: Vec<BankToken>,
    next_token: u32,
}

impl SampleCache {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            banks: HashMap::new(),
            load_order: Vec::new(),
            next_token: 1,
        }
    }

    fn insert_bank(&mut self, instruments: HashMap<(u8, u8, u8), Instrument>) -> BankToken {
        let token = BankToken(self.next_token);
        self.next_token += 1;
        self.banks.insert(token, Bank { instruments });
        self.load_order.push(token);
        token
    }

    pub fn load_native(&mut self, bytes: &[u8]) -> EngineResult<BankToken> {
        let instruments = native::parse(bytes)?;
        info!(
            "loaded native bank with {} program entries",
            instruments.len()
        );
        Ok(self.insert_bank(instruments))
    }

    pub fn load_dls(&mut self, bytes: &[u8]) -> EngineResult<BankToken> {
        let instruments = dls::parse(bytes)?;
        info!("loaded DLS bank with {} program entries", instruments.len());
        Ok(self.insert_bank(instruments))
    }

    pub fn load_sf2(&mut self, bytes: &[u8]) -> EngineResult<BankToken> {
        let instruments = sf2::parse(bytes)?;
        info!("loaded SF2 bank with {} program entries", instruments.len());
        Ok(self.insert_bank(instruments))
    }

    /// Drops this bank's instrument table. Any voice still bound to one
    /// of its samples holds its own `Arc` clone and keeps playing
    /// normally until it retires; no caller-side quiesce is required.
    pub fn unload_bank(&mut self, token: BankToken) {
        if self.banks.remove(&token).is_some() {
            self.load_order.retain(|t| *t != token);
            info!("unloaded bank {:?}", token);
        } else {
            warn!("unload_bank called on unknown token {:?}", token);
        }
    }

    fn find_instrument(&self, bank_msb: u8, bank_lsb: u8, program: u8) -> Option<&Instrument> {
        // Search most-recently-loaded bank first so a user bank can
        // shadow an earlier one for the same (bank, program) key.
        for token in self.load_order.iter().rev() {
            if let Some(bank) = self.banks.get(token) {
                if let Some(inst) = bank.instruments.get(&(bank_msb, bank_lsb, program)) {
                    return Some(inst);
                }
            }
        }
        None
    }

    fn find_any_bank_with_program(&self, program: u8) -> Option<&Instrument> {
        for token in self.load_order.iter().rev() {
            if let Some(bank) = self.banks.get(token) {
                if let Some(inst) = bank
                    .instruments
                    .iter()
                    .find(|((_, _, p), _)| *p == program)
                    .map(|(_, inst)| inst)
                {
                    return Some(inst);
                }
            }
        }
        None
    }

    /// Resolves `(bank_msb, bank_lsb, program, note, velocity)` into a
    /// leaf instrument, applying the fallback chain: exact match → GM
    /// bank 0 → any bank with matching program → piano (program 0) in
    /// any bank. Returns `None` only if no bank is loaded at all.
    pub fn resolve(
        &self,
        bank_msb: u8,
        bank_lsb: u8,
        program: u8,
        note: u8,
        _velocity: u8,
    ) -> Option<ResolvedInstrument> {
        let instrument = self
            .find_instrument(bank_msb, bank_lsb, program)
            .or_else(|| self.find_instrument(0, 0, program))
            .or_else(|| self.find_any_bank_with_program(program))
            .or_else(|| self.find_any_bank_with_program(0))?;

        let leaf = instrument.resolve_leaf(note)?;
        let is_drum = is_percussion_bank(bank_msb);

        let mut flags = leaf.flags;
        let root_pitch = if is_drum {
            flags.disable_looping = true;
            note
        } else {
            leaf.sample.root_pitch
        };

        Some(ResolvedInstrument {
            sample: leaf.sample.clone(),
            root_pitch,
            volume_adsr: to_ticks(&leaf.volume_adsr, self.sample_rate),
            pitch_adsr: leaf.pitch_adsr.as_ref().map(|a| to_ticks(a, self.sample_rate)),
            filter_adsr: leaf.filter_adsr.as_ref().map(|a| to_ticks(a, self.sample_rate)),
            lfos: leaf.lfos.clone(),
            filter: leaf.filter,
            pan: leaf.pan,
            flags,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }
}

pub(crate) fn unsupported(msg: impl Into<String>) -> EngineError {
    EngineError::Unsupported(msg.into())
}

pub(crate) fn bad_file(msg: impl Into<String>) -> EngineError {
    EngineError::BadFile(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_instrument(root_pitch: u8) -> Instrument {
        Instrument::Leaf(InstrumentLeaf {
            sample: Arc::new(Sample {
                pcm: SampleData::Mono16(vec![0; 100]),
                frame_count: 100,
                native_sample_rate: 44100,
                root_pitch,
                fine_tune_cents: 0,
                loop_start: 0,
                loop_end: 0,
            }),
            volume_adsr: AdsrDescriptor::flat_sustain(),
            pitch_adsr: None,
            filter_adsr: None,
            lfos: vec![],
            filter: None,
            pan: 0,
            flags: InstrumentFlags::default(),
        })
    }

    #[test]
    fn fallback_chain_reaches_gm_bank_zero() {
        let mut cache = SampleCache::new(44100);
        let mut instruments = HashMap::new();
        instruments.insert((0, 0, 0), leaf_instrument(60));
        cache.insert_bank(instruments);

        // Looking up an unrelated bank/program falls back to GM bank 0
        // program 0 only if program matches; here program 5 isn't
        // present anywhere so it falls to "any bank with matching
        // program" (none) then piano bank0/program0.
        let resolved = cache.resolve(8, 0, 5, 60, 100);
        assert!(resolved.is_some());
    }

    #[test]
    fn empty_cache_resolves_to_none() {
        let cache = SampleCache::new(44100);
        assert!(cache.resolve(0, 0, 0, 60, 100).is_none());
    }

    #[test]
    fn percussion_bank_disables_looping() {
        let mut cache = SampleCache::new(44100);
        let mut instruments = HashMap::new();
        let mut leaf = match leaf_instrument(36) {
            Instrument::Leaf(l) => l,
            _ => unreachable!(),
        };
        leaf.sample = Arc::new(Sample {
            pcm: SampleData::Mono16(vec![0; 10]),
            frame_count: 10,
            native_sample_rate: 44100,
            root_pitch: 36,
            fine_tune_cents: 0,
            loop_start: 0,
            loop_end: 8,
        });
        instruments.insert((120, 0, 0), Instrument::Leaf(leaf));
        cache.insert_bank(instruments);

        let resolved = cache.resolve(120, 0, 0, 36, 127).unwrap();
        assert!(resolved.flags.disable_looping);
    }
}
