//! SoundFont 2 bank loader, via the `rustysynth` crate for the RIFF
//! `pdta`/`sdta` parsing itself — this resolver only needs to walk the
//! parsed preset/instrument/sample-header tables and build the native
//! `Instrument` tree, the same shape of work as converting an SF2 into
//! a tracker's native instrument format.

use super::{
    AdsrDescriptor, AdsrStage, Instrument, InstrumentFlags, InstrumentLeaf, KeySplitRegion,
    Sample, SampleData, StageFlag, bad_file,
};
use crate::error::EngineResult;
use rustysynth::SoundFont;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// SF2 timecents use the same `2^(tc/1200)` seconds conversion as DLS.
fn timecents_to_usec(timecents: i16) -> u32 {
    if timecents <= -12000 {
        return 1;
    }
    let seconds = 2f64.powf(timecents as f64 / 1200.0);
    ((seconds * 1_000_000.0).round() as i64).clamp(1, u32::MAX as i64) as u32
}

fn envelope_from_region(
    delay_tc: i16,
    attack_tc: i16,
    hold_tc: i16,
    decay_tc: i16,
    sustain_cb: i16,
    release_tc: i16,
) -> AdsrDescriptor {
    let attack_us = timecents_to_usec(attack_tc);
    let hold_us = timecents_to_usec(hold_tc);
    let decay_us = timecents_to_usec(decay_tc);
    let release_us = timecents_to_usec(release_tc);
    let delay_us = timecents_to_usec(delay_tc);

    // sustain_cb is attenuation in centibels (0 = full volume, 1000 =
    // silence); convert to the engine's 0..VOLUME_RANGE sustain level.
    let sustain_level = ((1000 - sustain_cb.clamp(0, 1000) as i32) * super::VOLUME_RANGE) / 1000;

    AdsrDescriptor {
        stages: vec![
            AdsrStage {
                target_level: 0,
                duration_us: delay_us,
                flag: StageFlag::LinearRamp,
            },
            AdsrStage {
                target_level: super::VOLUME_RANGE,
                duration_us: attack_us,
                flag: StageFlag::LinearRamp,
            },
            AdsrStage {
                target_level: super::VOLUME_RANGE,
                duration_us: hold_us,
                flag: StageFlag::LinearRamp,
            },
            AdsrStage {
                target_level: sustain_level,
                duration_us: decay_us,
                flag: StageFlag::LinearRamp,
            },
            AdsrStage {
                target_level: sustain_level,
                duration_us: 1,
                flag: StageFlag::SustainUntilNoteOff,
            },
            AdsrStage {
                target_level: 0,
                duration_us: release_us,
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

pub fn parse(bytes: &[u8]) -> EngineResult<HashMap<(u8, u8, u8), Instrument>> {
    let mut reader = Cursor::new(bytes);
    let soundfont =
        SoundFont::new(&mut reader).map_err(|e| bad_file(format!("invalid SF2: {e}")))?;

    let sample_headers = soundfont.get_sample_headers();
    let wave_data = soundfont.get_wave_data();

    // Build one Sample per SF2 sample header, sharing the decoded PCM
    // with every preset/instrument region that points at it.
    let samples: Vec<Arc<Sample>> = sample_headers
        .iter()
        .map(|hdr| {
            let start = hdr.get_start() as usize;
            let end = hdr.get_end() as usize;
            let pcm: Vec<i16> = wave_data
                .get(start..end)
                .unwrap_or(&[])
                .to_vec();
            let loop_start = hdr.get_start_loop().saturating_sub(hdr.get_start()) as u32;
            let loop_end = hdr.get_end_loop().saturating_sub(hdr.get_start()) as u32;
            Arc::new(Sample {
                frame_count: pcm.len() as u32,
                native_sample_rate: hdr.get_sample_rate() as u32,
                root_pitch: hdr.get_original_pitch(),
                fine_tune_cents: hdr.get_pitch_correction() as i16,
                loop_start,
                loop_end,
                pcm: SampleData::Mono16(pcm),
            })
        })
        .collect();

    let mut instruments = HashMap::new();

    for preset in soundfont.get_presets() {
        let bank = preset.get_bank_number() as u8;
        let program = preset.get_patch_number() as u8;
        let is_percussion = bank == 128;
        let bank_msb = if is_percussion { 127 } else { bank };

        let mut regions = Vec::new();
        for preset_region in preset.get_regions() {
            let instrument = preset_region.get_instrument();
            for inst_region in instrument.get_regions() {
                let sample_index = inst_region.get_sample().get_sample_index();
                let sample = match samples.get(sample_index) {
                    Some(s) => s.clone(),
                    None => continue,
                };

                let key_low = inst_region
                    .get_key_range_start()
                    .max(preset_region.get_key_range_start())
                    as u8;
                let key_high = inst_region
                    .get_key_range_end()
                    .min(preset_region.get_key_range_end())
                    as u8;
                if key_low > key_high {
                    continue;
                }

                let volume_adsr = envelope_from_region(
                    inst_region.get_delay_volume_envelope(),
                    inst_region.get_attack_volume_envelope(),
                    inst_region.get_hold_volume_envelope(),
                    inst_region.get_decay_volume_envelope(),
                    inst_region.get_sustain_volume_envelope(),
                    inst_region.get_release_volume_envelope(),
                );

                let pan = (inst_region.get_pan() / 1000.0 * 63.0).clamp(-63.0, 63.0) as i8;

                regions.push(KeySplitRegion {
                    key_low,
                    key_high,
                    child: Box::new(Instrument::Leaf(InstrumentLeaf {
                        sample,
                        volume_adsr,
                        pitch_adsr: None,
                        filter_adsr: None,
                        lfos: Vec::new(),
                        filter: None,
                        pan,
                        flags: InstrumentFlags {
                            disable_looping: is_percussion,
                            play_at_sample_rate: false,
                            mono_voice_only: false,
                        },
                    })),
                });
            }
        }

        if regions.is_empty() {
            continue;
        }
        instruments.insert((bank_msb, 0, program), Instrument::KeySplit(regions));
    }

    Ok(instruments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_input() {
        let bytes = vec![0u8; 16];
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn timecent_conversion_matches_dls() {
        assert_eq!(timecents_to_usec(0), 1_000_000);
        assert_eq!(timecents_to_usec(-20000), 1);
    }
}
