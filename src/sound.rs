//! Songs, Sounds & Event Scheduling — the `Sound` half.
//!
//! A `Sound` is a one-shot PCM pull-stream, distinct from a Song: it
//! owns one of the Mixer's dedicated Sound voice slots rather than
//! sharing the Song voice pool.

use crate::command::SoundId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Ok(usize),
    Eof,
    Error,
}

/// Pull-callback a Sound uses to obtain more PCM. Implemented by
/// compressed-format decoder adapters (MP3/WAV/AIFF/AU/FLAC/Vorbis) or
/// directly by the host for raw PCM playback; the core never sees
/// compressed bytes.
pub trait FillSource: Send {
    fn fill(&mut self, out: &mut [i16]) -> FillStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundTransport {
    Idle,
    Playing,
    Paused,
    Stopped,
    Errored,
}

pub struct Sound {
    pub id: SoundId,
    source: Box<dyn FillSource>,
    pub source_rate: u32,
    output_rate: u32,
    pub channels: u8,
    pub bits: u8,
    rate_multiplier: f32,
    volume: f32,
    pan: f32,
    reverb_send: f32,
    transport: SoundTransport,
    loop_enabled: bool,
    buffer: std::collections::VecDeque<i16>,
    fill_scratch: Vec<i16>,
    frac_pos: f32,
}

impl Sound {
    pub fn new(
        id: SoundId,
        source: Box<dyn FillSource>,
        rate: u32,
        channels: u8,
        bits: u8,
        output_rate: u32,
    ) -> Self {
        let channel_count = channels.max(1) as usize;
        Self {
            id,
            source,
            source_rate: rate,
            output_rate,
            channels,
            bits,
            rate_multiplier: 1.0,
            volume: 1.0,
            pan: 0.0,
            reverb_send: 0.0,
            transport: SoundTransport::Idle,
            loop_enabled: false,
            buffer: std::collections::VecDeque::new(),
            fill_scratch: vec![0i16; channel_count * 256],
            frac_pos: 0.0,
        }
    }

    /// Effective playback speed in source frames per output frame:
    /// `source_rate / output_rate`, scaled by the host-set rate
    /// multiplier.
    fn effective_rate(&self) -> f32 {
        (self.source_rate as f32 / self.output_rate.max(1) as f32) * self.rate_multiplier
    }

    pub fn start(&mut self) {
        self.transport = SoundTransport::Playing;
    }

    pub fn pause(&mut self) {
        if self.transport == SoundTransport::Playing {
            self.transport = SoundTransport::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.transport == SoundTransport::Paused {
            self.transport = SoundTransport::Playing;
        }
    }

    pub fn stop(&mut self) {
        self.transport = SoundTransport::Stopped;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    pub fn set_rate(&mut self, multiplier: f32) {
        self.rate_multiplier = multiplier.max(0.01);
    }

    pub fn set_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn reverb_send(&self) -> f32 {
        self.reverb_send
    }

    pub fn set_reverb_send(&mut self, send: f32) {
        self.reverb_send = send.clamp(0.0, 1.0);
    }

    pub fn is_playing(&self) -> bool {
        self.transport == SoundTransport::Playing
    }

    pub fn transport(&self) -> SoundTransport {
        self.transport
    }

    pub fn playback_rate(&self) -> f32 {
        self.rate_multiplier
    }

    /// Ensures the internal queue holds at least `frames_needed` output
    /// frames' worth of source material (accounting for the resample
    /// rate, plus one frame of interpolation lookahead) by pulling from
    /// the fill callback. Terminates the Sound on `Eof`/`Error`.
    pub fn top_up(&mut self, frames_needed: usize) {
        if self.transport != SoundTransport::Playing {
            return;
        }
        let channels = self.channels.max(1) as usize;
        let source_frames_needed = (frames_needed as f32 * self.effective_rate()).ceil() as usize + 1;
        while self.buffer.len() < source_frames_needed * channels {
            match self.source.fill(&mut self.fill_scratch) {
                FillStatus::Ok(n) => {
                    if n == 0 {
                        break;
                    }
                    self.buffer.extend(self.fill_scratch.iter().take(n * channels).copied());
                }
                FillStatus::Eof => {
                    if self.loop_enabled {
                        // Host-owned sources are responsible for
                        // rewinding themselves on loop; the core just
                        // keeps pulling.
                        continue;
                    }
                    if self.buffer.is_empty() {
                        self.transport = SoundTransport::Stopped;
                    }
                    break;
                }
                FillStatus::Error => {
                    self.transport = SoundTransport::Errored;
                    break;
                }
            }
        }
    }

    fn frame_at(&self, index: usize, channels: usize) -> (i16, i16) {
        if channels == 1 {
            let s = *self.buffer.get(index).unwrap_or(&0);
            (s, s)
        } else {
            let l = *self.buffer.get(index * channels).unwrap_or(&0);
            let r = *self.buffer.get(index * channels + 1).unwrap_or(&0);
            (l, r)
        }
    }

    /// Pops one (left, right) frame, linearly interpolated between the
    /// two nearest buffered source frames at the current resample
    /// position, or silence if starved. Advances the fractional
    /// position by `source_rate / output_rate * rate_multiplier` and
    /// drops whole source frames from the queue as the position crosses
    /// them.
    pub fn pop_frame(&mut self) -> (i16, i16) {
        let channels = self.channels.max(1) as usize;
        if self.buffer.is_empty() {
            return (0, 0);
        }
        let (l0, r0) = self.frame_at(0, channels);
        let (l1, r1) = self.frame_at(1, channels);
        let frac = self.frac_pos;
        let l = l0 as f32 + (l1 as f32 - l0 as f32) * frac;
        let r = r0 as f32 + (r1 as f32 - r0 as f32) * frac;

        self.frac_pos += self.effective_rate();
        while self.frac_pos >= 1.0 && self.buffer.len() >= channels {
            for _ in 0..channels {
                self.buffer.pop_front();
            }
            self.frac_pos -= 1.0;
        }

        (l as i16, r as i16)
    }

    pub fn frames_available(&self) -> usize {
        self.buffer.len() / self.channels.max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSource {
        remaining: usize,
    }

    impl FillSource for CountingSource {
        fn fill(&mut self, out: &mut [i16]) -> FillStatus {
            if self.remaining == 0 {
                return FillStatus::Eof;
            }
            let n = out.len().min(self.remaining);
            for s in out.iter_mut().take(n) {
                *s = 1000;
            }
            self.remaining -= n;
            FillStatus::Ok(n)
        }
    }

    #[test]
    fn top_up_stops_at_eof() {
        let mut sound = Sound::new(
            SoundId(0),
            Box::new(CountingSource { remaining: 10 }),
            44100,
            1,
            16,
            44100,
        );
        sound.start();
        sound.top_up(100);
        assert_eq!(sound.frames_available(), 10);
        for _ in 0..10 {
            sound.pop_frame();
        }
        sound.top_up(1);
        assert_eq!(sound.transport(), SoundTransport::Stopped);
    }

    struct ErroringSource;
    impl FillSource for ErroringSource {
        fn fill(&mut self, _out: &mut [i16]) -> FillStatus {
            FillStatus::Error
        }
    }

    #[test]
    fn errored_source_marks_sound_errored() {
        let mut sound = Sound::new(SoundId(1), Box::new(ErroringSource), 44100, 1, 16, 44100);
        sound.start();
        sound.top_up(10);
        assert_eq!(sound.transport(), SoundTransport::Errored);
    }

    struct RampSource {
        next: i16,
    }

    impl FillSource for RampSource {
        fn fill(&mut self, out: &mut [i16]) -> FillStatus {
            for s in out.iter_mut() {
                *s = self.next;
                self.next = self.next.saturating_add(100);
            }
            FillStatus::Ok(out.len())
        }
    }

    #[test]
    fn resampling_interpolates_at_half_rate() {
        let mut sound = Sound::new(SoundId(2), Box::new(RampSource { next: 0 }), 22050, 1, 16, 44100);
        sound.start();
        sound.top_up(4);
        let (f0, _) = sound.pop_frame();
        let (f1, _) = sound.pop_frame();
        assert_eq!(f0, 0);
        assert_eq!(f1, 50);
    }
}
