//! Native engine bank format: a small RIFF-style chunked binary,
//! indexed by `(bank, program)`, each entry describing ADSR/LFO
//! numerically plus sample indices.
//!
//! Chunk layout (all integers little-endian):
//! ```text
//! "BAEB" magic (4 bytes)
//! u32 sample_count
//!   per sample: u8 channels, u32 frame_count, u32 sample_rate,
//!               u8 root_pitch, i16 fine_tune_cents,
//!               u32 loop_start, u32 loop_end,
//!               frame_count * channels * i16 PCM
//! u32 instrument_count
//!   per instrument: u8 bank_msb, u8 bank_lsb, u8 program,
//!                   u32 sample_index, u8 pan (signed),
//!                   u8 flags (bit0 disable_looping, bit1 play_at_sample_rate,
//!                             bit2 mono_voice_only),
//!                   u8 stage_count, stage_count * (i32 target_level,
//!                   u32 duration_us, u8 flag)
//! ```

use super::{
    AdsrDescriptor, AdsrStage, Instrument, InstrumentFlags, InstrumentLeaf, Sample, SampleData,
    StageFlag, bad_file,
};
use crate::error::EngineResult;
use std::collections::HashMap;
use std::sync::Arc;

const MAGIC: &[u8; 4] = b"BAEB";

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> EngineResult<u8> {
        let v = *self.data.get(self.pos).ok_or_else(|| bad_file("truncated bank"))?;
        self.pos += 1;
        Ok(v)
    }

    fn i8(&mut self) -> EngineResult<i8> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> EngineResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i16(&mut self) -> EngineResult<i16> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> EngineResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> EngineResult<i32> {
        Ok(self.u32()? as i32)
    }

    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| bad_file("truncated bank"))?;
        self.pos = end;
        Ok(slice)
    }
}

fn stage_flag(byte: u8) -> EngineResult<StageFlag> {
    match byte {
        0 => Ok(StageFlag::LinearRamp),
        1 => Ok(StageFlag::SustainUntilNoteOff),
        2 => Ok(StageFlag::Release),
        3 => Ok(StageFlag::Terminate),
        other => Err(bad_file(format!("unknown ADSR stage flag {other}"))),
    }
}

fn read_adsr(cur: &mut Cursor) -> EngineResult<AdsrDescriptor> {
    let stage_count = cur.u8()?;
    let mut stages = Vec::with_capacity(stage_count as usize);
    for _ in 0..stage_count {
        let target_level = cur.i32()?;
        let duration_us = cur.u32()?;
        let flag = stage_flag(cur.u8()?)?;
        stages.push(AdsrStage {
            target_level,
            duration_us,
            flag,
        });
    }
    let adsr = AdsrDescriptor { stages };
    if !adsr.validate() {
        return Err(bad_file("ADSR has no sustain stage"));
    }
    Ok(adsr)
}

pub fn parse(bytes: &[u8]) -> EngineResult<HashMap<(u8, u8, u8), Instrument>> {
    let mut cur = Cursor::new(bytes);
    if cur.take(4)? != MAGIC {
        return Err(bad_file("not a native engine bank"));
    }

    let sample_count = cur.u32()?;
    let mut samples = Vec::with_capacity(sample_count as usize);
    for _ in 0..sample_count {
        let channels = cur.u8()?;
        let frame_count = cur.u32()?;
        let native_sample_rate = cur.u32()?;
        let root_pitch = cur.u8()?;
        let fine_tune_cents = cur.i16()?;
        let loop_start = cur.u32()?;
        let loop_end = cur.u32()?;

        let total_samples = frame_count as usize * channels as usize;
        let raw = cur.take(total_samples * 2)?;
        let pcm_values: Vec<i16> = raw
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();

        let pcm = if channels == 2 {
            SampleData::Stereo16(pcm_values.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
        } else {
            SampleData::Mono16(pcm_values)
        };

        samples.push(Arc::new(Sample {
            pcm,
            frame_count,
            native_sample_rate,
            root_pitch,
            fine_tune_cents,
            loop_start,
            loop_end,
        }));
    }

    let instrument_count = cur.u32()?;
    let mut instruments = HashMap::with_capacity(instrument_count as usize);
    for _ in 0..instrument_count {
        let bank_msb = cur.u8()?;
        let bank_lsb = cur.u8()?;
        let program = cur.u8()?;
        let sample_index = cur.u32()? as usize;
        let pan = cur.i8()?;
        let flag_bits = cur.u8()?;

        let sample = samples
            .get(sample_index)
            .ok_or_else(|| bad_file("sample index out of range"))?
            .clone();
        let volume_adsr = read_adsr(&mut cur)?;

        let leaf = InstrumentLeaf {
            sample,
            volume_adsr,
            pitch_adsr: None,
            filter_adsr: None,
            lfos: Vec::new(),
            filter: None,
            pan,
            flags: InstrumentFlags {
                disable_looping: flag_bits & 0b001 != 0,
                play_at_sample_rate: flag_bits & 0b010 != 0,
                mono_voice_only: flag_bits & 0b100 != 0,
            },
        };
        instruments.insert((bank_msb, bank_lsb, program), Instrument::Leaf(leaf));
    }

    Ok(instruments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_minimal_bank() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes()); // 1 sample
        buf.push(1); // mono
        buf.extend_from_slice(&4u32.to_le_bytes()); // frame_count
        buf.extend_from_slice(&44100u32.to_le_bytes());
        buf.push(60); // root pitch
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // loop_start
        buf.extend_from_slice(&0u32.to_le_bytes()); // loop_end (no loop)
        for s in [0i16, 100, -100, 0] {
            buf.extend_from_slice(&s.to_le_bytes());
        }

        buf.extend_from_slice(&1u32.to_le_bytes()); // 1 instrument
        buf.push(0); // bank_msb
        buf.push(0); // bank_lsb
        buf.push(0); // program
        buf.extend_from_slice(&0u32.to_le_bytes()); // sample_index
        buf.push(0); // pan
        buf.push(0); // flags
        buf.push(2); // 2 ADSR stages
        buf.extend_from_slice(&4096i32.to_le_bytes());
        buf.extend_from_slice(&10_000u32.to_le_bytes());
        buf.push(1); // sustain_until_note_off
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&500_000u32.to_le_bytes());
        buf.push(3); // terminate
        buf
    }

    #[test]
    fn parses_minimal_bank() {
        let bytes = encode_minimal_bank();
        let instruments = parse(&bytes).unwrap();
        assert_eq!(instruments.len(), 1);
        let inst = instruments.get(&(0, 0, 0)).unwrap();
        match inst {
            Instrument::Leaf(leaf) => assert_eq!(leaf.sample.frame_count, 4),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = b"XXXX".to_vec();
        assert!(parse(&bytes).is_err());
    }
}
