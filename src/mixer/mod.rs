//! Mixer & Master Bus: the single per-block entry point that drains
//! host commands, advances every Song and Sound, renders their voices,
//! applies the shared reverb send, and writes the final interleaved
//! PCM block.

pub mod reverb;
pub mod velocity_curve;

use crate::bank::{BankToken, SampleCache};
use crate::command::{CommandRing, ControlCommand, SongId, SoundId};
use crate::error::EngineResult;
use crate::meter::Meter;
use crate::midi::EventStream;
use crate::song::Song;
use crate::sound::{FillSource, Sound};
use crate::voice::{FrameContext, VoiceOwner, VoicePool};
use log::warn;
use reverb::{ReverbType, ReverbUnit};
use std::collections::HashMap;
use velocity_curve::VelocityCurve;

/// Sink a decoded block can be mirrored to for offline rendering or
/// diagnostic capture (a WAV writer in the demo binary, typically).
pub trait CaptureSink: Send {
    fn write_block(&mut self, interleaved: &[i16]);
}

struct SongSlot {
    generation: u64,
    song: Song,
}

struct SoundSlot {
    generation: u64,
    sound: Sound,
}

pub struct MixerConfig {
    pub sample_rate: u32,
    pub max_song_voices: usize,
    pub max_sound_voices: usize,
    pub mix_level: f32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            max_song_voices: 32,
            max_sound_voices: 8,
            mix_level: 1.0,
        }
    }
}

/// The engine's single top-level object. One `Mixer` owns the sample
/// cache, every Song and Sound slot, the shared voice pools and the
/// master reverb; everything downstream of it is driven exclusively by
/// `render_block`, with a strict upward dependency and no back-references.
pub struct Mixer {
    sample_rate: u32,
    sample_cache: SampleCache,
    song_voices: VoicePool,
    songs: HashMap<SongId, SongSlot>,
    next_song_id: u32,
    max_sound_voices: usize,
    sounds: HashMap<SoundId, SoundSlot>,
    next_sound_id: u32,
    command_ring: CommandRing,
    master_volume: f32,
    master_muted: bool,
    mix_level: f32,
    velocity_curve: VelocityCurve,
    reverb: ReverbUnit,
    meter: Meter,
    capture: Option<Box<dyn CaptureSink>>,
    finished_songs: Vec<SongId>,
    frame_buf_l: Vec<f32>,
    frame_buf_r: Vec<f32>,
    reverb_send_buf: Vec<f32>,
    meter_scratch: Vec<i32>,
    contexts: HashMap<SongId, [FrameContext; 16]>,
}

impl Mixer {
    pub fn open(config: MixerConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            sample_cache: SampleCache::new(config.sample_rate),
            song_voices: VoicePool::new(config.max_song_voices, config.sample_rate),
            songs: HashMap::new(),
            next_song_id: 1,
            max_sound_voices: config.max_sound_voices,
            sounds: HashMap::new(),
            next_sound_id: 1,
            command_ring: CommandRing::new(),
            master_volume: 1.0,
            master_muted: false,
            mix_level: config.mix_level,
            velocity_curve: VelocityCurve::MiniBaeS,
            reverb: ReverbUnit::new(config.sample_rate),
            meter: Meter::new(),
            capture: None,
            finished_songs: Vec::new(),
            frame_buf_l: Vec::new(),
            frame_buf_r: Vec::new(),
            reverb_send_buf: Vec::new(),
            meter_scratch: Vec::new(),
            contexts: HashMap::new(),
        }
    }

    /// Tears down the engine. Active voices are simply dropped; any
    /// sample data they still reference stays alive through its `Arc`
    /// until the last voice referencing it is dropped too.
    pub fn close(&mut self) {
        self.songs.clear();
        self.sounds.clear();
        self.capture = None;
    }

    pub fn control_handle(&self) -> crate::command::ControlHandle {
        self.command_ring.handle()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    // -- Bank loading -----------------------------------------------

    pub fn load_native_bank(&mut self, bytes: &[u8]) -> EngineResult<BankToken> {
        self.sample_cache.load_native(bytes)
    }

    pub fn load_dls_bank(&mut self, bytes: &[u8]) -> EngineResult<BankToken> {
        self.sample_cache.load_dls(bytes)
    }

    pub fn load_sf2_bank(&mut self, bytes: &[u8]) -> EngineResult<BankToken> {
        self.sample_cache.load_sf2(bytes)
    }

    /// Unloads a bank immediately. Safe even with voices still playing
    /// from it: each voice holds an `Arc` clone of its `Sample`, so the
    /// underlying PCM stays alive until the last such voice retires —
    /// no separate quiesce handshake is needed for sample memory.
    fn unload_bank(&mut self, token: BankToken) {
        self.sample_cache.unload_bank(token);
    }

    // -- Songs --------------------------------------------------------

    pub fn add_song(&mut self, stream: Box<dyn EventStream>) -> SongId {
        let id = SongId(self.next_song_id);
        self.next_song_id += 1;
        let generation = id.0 as u64;
        self.songs.insert(
            id,
            SongSlot {
                generation,
                song: Song::new(id, stream),
            },
        );
        id
    }

    pub fn song_mut(&mut self, id: SongId) -> Option<&mut Song> {
        self.songs.get_mut(&id).map(|s| &mut s.song)
    }

    pub fn song(&self, id: SongId) -> Option<&Song> {
        self.songs.get(&id).map(|s| &s.song)
    }

    fn delete_song(&mut self, id: SongId, generation: u64) {
        if let Some(slot) = self.songs.get(&id) {
            if slot.generation != generation {
                return; // stale command targeting a reused id
            }
        }
        self.song_voices
            .terminate_owner(VoiceOwner::Song { song: id, channel: 0 });
        for ch in 1..16u8 {
            self.song_voices
                .terminate_owner(VoiceOwner::Song { song: id, channel: ch });
        }
        self.songs.remove(&id);
    }

    // -- Sounds ---------------------------------------------------------

    pub fn add_sound(
        &mut self,
        source: Box<dyn FillSource>,
        source_rate: u32,
        channels: u8,
        bits: u8,
    ) -> Option<SoundId> {
        let active = self
            .sounds
            .values()
            .filter(|s| s.sound.is_playing())
            .count();
        if active >= self.max_sound_voices {
            warn!("sound voice pool exhausted, refusing new Sound");
            return None;
        }
        let id = SoundId(self.next_sound_id);
        self.next_sound_id += 1;
        let generation = id.0 as u64;
        self.sounds.insert(
            id,
            SoundSlot {
                generation,
                sound: Sound::new(id, source, source_rate, channels, bits, self.sample_rate),
            },
        );
        Some(id)
    }

    pub fn sound_mut(&mut self, id: SoundId) -> Option<&mut Sound> {
        self.sounds.get_mut(&id).map(|s| &mut s.sound)
    }

    fn delete_sound(&mut self, id: SoundId, generation: u64) {
        if let Some(slot) = self.sounds.get(&id) {
            if slot.generation != generation {
                return;
            }
        }
        self.sounds.remove(&id);
    }

    // -- Master bus controls --------------------------------------------

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = volume.clamp(0.0, 1.0);
    }

    pub fn set_master_mute(&mut self, muted: bool) {
        self.master_muted = muted;
    }

    pub fn set_reverb_type(&mut self, reverb_type: ReverbType) {
        self.reverb.set_type(reverb_type);
    }

    pub fn set_custom_reverb_preset(&mut self, preset: reverb::CustomPreset) {
        self.reverb.set_custom_preset(preset);
    }

    pub fn set_comb_count(&mut self, count: u8) {
        self.reverb.set_comb_count(count);
    }

    pub fn set_comb_delay_ms(&mut self, index: usize, delay_ms: u32) {
        self.reverb.set_comb_delay_ms(index, delay_ms);
    }

    pub fn set_comb_feedback_midi(&mut self, index: usize, feedback_midi: u32) {
        self.reverb.set_comb_feedback_midi(index, feedback_midi);
    }

    pub fn set_comb_gain_midi(&mut self, index: usize, gain_midi: u32) {
        self.reverb.set_comb_gain_midi(index, gain_midi);
    }

    pub fn set_lowpass_midi(&mut self, lowpass_midi: u32) {
        self.reverb.set_lowpass_midi(lowpass_midi);
    }

    pub fn set_wet_mix_midi(&mut self, wet_mix_midi: u32) {
        self.reverb.set_wet_mix_midi(wet_mix_midi);
    }

    pub fn set_default_velocity_curve(&mut self, curve: VelocityCurve) {
        self.velocity_curve = curve;
    }

    pub fn begin_capture(&mut self, sink: Box<dyn CaptureSink>) {
        self.capture = Some(sink);
    }

    pub fn end_capture(&mut self) {
        self.capture = None;
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Number of Song voices currently sounding (not idle), across every
    /// Song sharing the pool. Useful for host-side voice usage displays.
    pub fn active_song_voice_count(&self) -> usize {
        self.song_voices.voices().iter().filter(|v| !v.is_idle()).count()
    }

    /// Whether a given Song/channel/note currently has a sounding voice
    /// bound to it.
    pub fn song_voice_is_active(&self, song: SongId, channel: u8, note: u8) -> bool {
        self.song_voices.voices().iter().any(|v| {
            !v.is_idle() && v.owner() == Some(VoiceOwner::Song { song, channel }) && v.note() == note
        })
    }

    /// Commands fired by the audio thread itself when a Song reaches
    /// its end without looping; the host drains this each block.
    pub fn take_finished_songs(&mut self) -> Vec<SongId> {
        std::mem::take(&mut self.finished_songs)
    }

    fn drain_commands(&mut self) {
        let mut pending = Vec::new();
        self.command_ring.drain(|cmd| pending.push(cmd));
        for cmd in pending {
            self.apply_command(cmd);
        }
    }

    fn apply_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::SongEvent { song, event } => {
                if let Some(slot) = self.songs.get_mut(&song) {
                    slot.song.inject(event);
                }
            }
            ControlCommand::SongStart { song } => {
                if let Some(slot) = self.songs.get_mut(&song) {
                    slot.song.start();
                }
            }
            ControlCommand::SongStop { song } => {
                if let Some(slot) = self.songs.get_mut(&song) {
                    slot.song.stop();
                }
            }
            ControlCommand::SongSeek { song, position_us } => {
                if let Some(slot) = self.songs.get_mut(&song) {
                    slot.song.seek_us(position_us);
                }
            }
            ControlCommand::SongDelete { song, generation } => self.delete_song(song, generation),
            ControlCommand::SoundStart { sound } => {
                if let Some(slot) = self.sounds.get_mut(&sound) {
                    slot.sound.start();
                }
            }
            ControlCommand::SoundStop { sound } => {
                if let Some(slot) = self.sounds.get_mut(&sound) {
                    slot.sound.stop();
                }
            }
            ControlCommand::SoundDelete { sound, generation } => {
                self.delete_sound(sound, generation)
            }
            ControlCommand::UnloadBank { token, generation: _ } => self.unload_bank(token),
        }
    }

    /// Renders one block of interleaved stereo 16-bit PCM into `out`
    /// (`out.len()` must be even; `out.len() / 2` is the frame count).
    pub fn render_block(&mut self, out: &mut [i16]) {
        self.drain_commands();

        let frames = out.len() / 2;
        self.frame_buf_l.clear();
        self.frame_buf_l.resize(frames, 0.0);
        self.frame_buf_r.clear();
        self.frame_buf_r.resize(frames, 0.0);
        self.reverb_send_buf.clear();
        self.reverb_send_buf.resize(frames, 0.0);

        let sample_rate = self.sample_rate;
        let master_volume = if self.master_muted { 0.0 } else { self.master_volume };

        self.contexts.clear();
        let contexts = &mut self.contexts;
        let song_voices = &mut self.song_voices;
        let sample_cache = &self.sample_cache;
        let finished = &mut self.finished_songs;
        for (id, slot) in self.songs.iter_mut() {
            slot.song.advance_block(frames as u32, sample_rate, song_voices, sample_cache, &mut |finished_id| {
                finished.push(finished_id);
            });
            contexts.insert(*id, slot.song.render_contexts(1.0, master_volume));
        }

        for voice in self.song_voices.voices_mut() {
            if voice.is_idle() {
                continue;
            }
            let Some(VoiceOwner::Song { song, channel }) = voice.owner() else {
                continue;
            };
            let Some(ctx_table) = contexts.get(&song) else {
                continue;
            };
            let ctx = ctx_table[channel as usize % 16];
            for frame in 0..frames {
                let (l, r, send) = voice.process_frame(&ctx);
                self.frame_buf_l[frame] += l;
                self.frame_buf_r[frame] += r;
                self.reverb_send_buf[frame] += send;
            }
        }

        for slot in self.sounds.values_mut() {
            slot.sound.top_up(frames);
            if !slot.sound.is_playing() && slot.sound.frames_available() == 0 {
                continue;
            }
            let volume = slot.sound.volume() * master_volume;
            let pan = slot.sound.pan();
            let left_gain = volume * (1.0 - pan.max(0.0));
            let right_gain = volume * (1.0 + pan.min(0.0));
            let send_level = slot.sound.reverb_send();
            for frame in 0..frames {
                let (l, r) = slot.sound.pop_frame();
                let l = l as f32 / i16::MAX as f32;
                let r = r as f32 / i16::MAX as f32;
                self.frame_buf_l[frame] += l * left_gain;
                self.frame_buf_r[frame] += r * right_gain;
                if send_level > 0.0 {
                    self.reverb_send_buf[frame] += (l + r) * 0.5 * volume * send_level;
                }
            }
        }

        for frame in 0..frames {
            let send_i32 = (self.reverb_send_buf[frame] * i16::MAX as f32) as i32;
            let (wet_l, wet_r) = self.reverb.process(send_i32);
            self.frame_buf_l[frame] += wet_l as f32 / i16::MAX as f32;
            self.frame_buf_r[frame] += wet_r as f32 / i16::MAX as f32;
        }

        self.meter_scratch.clear();
        for frame in 0..frames {
            let l = (self.frame_buf_l[frame] * master_volume * self.mix_level * i16::MAX as f32)
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            let r = (self.frame_buf_r[frame] * master_volume * self.mix_level * i16::MAX as f32)
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            out[frame * 2] = l;
            out[frame * 2 + 1] = r;
            self.meter_scratch.push(l as i32);
            self.meter_scratch.push(r as i32);
        }
        self.meter.accumulate(&self.meter_scratch);

        if let Some(sink) = &mut self.capture {
            sink.write_block(out);
        }
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::LiveEventQueue;

    #[test]
    fn render_block_with_no_songs_is_silent() {
        let mut mixer = Mixer::open(MixerConfig::default());
        let mut out = vec![1i16; 256];
        mixer.render_block(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn add_and_delete_song_round_trips() {
        let mut mixer = Mixer::open(MixerConfig::default());
        let id = mixer.add_song(Box::new(LiveEventQueue::new()));
        assert!(mixer.song(id).is_some());
        mixer.command_ring.handle().send(ControlCommand::SongDelete { song: id, generation: id.0 as u64 });
        let mut out = vec![0i16; 16];
        mixer.render_block(&mut out);
        assert!(mixer.song(id).is_none());
    }

    #[test]
    fn stale_delete_generation_is_ignored() {
        let mut mixer = Mixer::open(MixerConfig::default());
        let id = mixer.add_song(Box::new(LiveEventQueue::new()));
        mixer.delete_song(id, id.0 as u64 + 1);
        assert!(mixer.song(id).is_some());
    }
}
