//! WAV file capture sink for offline rendering and diagnostics.

use crate::mixer::CaptureSink;
use hound::{WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub struct WavCaptureSink {
    writer: WavWriter<BufWriter<File>>,
}

impl WavCaptureSink {
    pub fn create(path: &Path, sample_rate: u32) -> std::io::Result<Self> {
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec).map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self { writer })
    }
}

impl CaptureSink for WavCaptureSink {
    fn write_block(&mut self, interleaved: &[i16]) {
        for &sample in interleaved {
            if let Err(e) = self.writer.write_sample(sample) {
                log::error!("WAV capture write failed: {e}");
                return;
            }
        }
    }
}
