//! Songs, Sounds & Event Scheduling — the `Song` half.

use crate::bank::SampleCache;
use crate::command::SongId;
use crate::midi::{EventStream, MetaKind, MidiEvent, pitch_bend_semitones};
use crate::voice::{FrameContext, VoiceOwner, VoicePool};
use log::{debug, trace};

const CHANNEL_COUNT: usize = 16;
const DEFAULT_BEND_RANGE: f32 = 2.0;

#[derive(Debug, Clone, Copy)]
pub struct ChannelState {
    pub bank_msb: u8,
    pub bank_lsb: u8,
    pub program: u8,
    pub volume: u8,      // CC7
    pub expression: u8,  // CC11
    pub pan: i8,          // CC10, -63..63
    pub sustain: bool,    // CC64
    pub modulation: u8,   // CC1
    pub reverb_send: u8,  // CC91
    pub chorus_send: u8,  // CC93
    pub pitch_bend: u16,  // 14-bit, center 8192
    pub bend_range_semitones: f32,
    pub muted: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            bank_msb: 0,
            bank_lsb: 0,
            program: 0,
            volume: 100,
            expression: 127,
            pan: 0,
            sustain: false,
            modulation: 0,
            reverb_send: 0,
            chorus_send: 0,
            pitch_bend: 8192,
            bend_range_semitones: DEFAULT_BEND_RANGE,
            muted: false,
        }
    }
}

impl ChannelState {
    fn to_frame_context(&self, song_volume: f32, master_volume: f32) -> FrameContext {
        FrameContext {
            channel_volume: self.volume as f32 / 127.0,
            channel_expression: self.expression as f32 / 127.0,
            channel_pan: self.pan as f32 / 63.0,
            pitch_bend_semitones: pitch_bend_semitones(self.pitch_bend, self.bend_range_semitones),
            song_volume,
            master_volume,
            reverb_send: self.reverb_send as f32 / 127.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SongTransport {
    Idle,
    Playing,
    Paused,
    Finished,
}

/// A live MIDI event source backed by the control ring's injected
/// events rather than a parsed file — the default `EventStream` for
/// `note_on`/`note_off`/... style live play.
pub struct LiveEventQueue {
    pending: std::collections::VecDeque<(u64, MidiEvent)>,
}

impl LiveEventQueue {
    pub fn new() -> Self {
        Self {
            pending: std::collections::VecDeque::new(),
        }
    }

    pub fn push(&mut self, t_us: u64, event: MidiEvent) {
        self.pending.push_back((t_us, event));
    }
}

impl Default for LiveEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream for LiveEventQueue {
    fn next_event(&mut self) -> Option<(u64, MidiEvent)> {
        self.pending.pop_front()
    }

    fn seek_to_start(&mut self) {
        self.pending.clear();
    }
}

pub struct Song {
    pub id: SongId,
    stream: Box<dyn EventStream>,
    /// Live events injected directly by the host (`note_on`, CC, ...)
    /// or relayed from the command ring; merged with the scripted
    /// stream every block regardless of which `EventStream` is bound.
    live_queue: std::collections::VecDeque<MidiEvent>,
    channels: [ChannelState; CHANNEL_COUNT],
    transpose: i32,
    tempo_percent: u32,
    loop_enabled: bool,
    volume: u8,
    playhead_us: u64,
    declared_length_us: Option<u64>,
    transport: SongTransport,
    finished_fired: bool,
    reverb_send_level: u8,
    /// One event popped from `stream` ahead of the current block boundary
    /// and held until its timestamp falls within a later block.
    pending_stream_event: Option<(u64, MidiEvent)>,
}

impl Song {
    pub fn new(id: SongId, stream: Box<dyn EventStream>) -> Self {
        let declared_length_us = stream.length_us();
        Self {
            id,
            stream,
            live_queue: std::collections::VecDeque::new(),
            channels: [ChannelState::default(); CHANNEL_COUNT],
            transpose: 0,
            tempo_percent: 100,
            loop_enabled: false,
            volume: 127,
            playhead_us: 0,
            declared_length_us,
            transport: SongTransport::Idle,
            finished_fired: false,
            reverb_send_level: 0,
            pending_stream_event: None,
        }
    }

    pub fn start(&mut self) {
        self.transport = SongTransport::Playing;
    }

    pub fn pause(&mut self) {
        if self.transport == SongTransport::Playing {
            self.transport = SongTransport::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.transport == SongTransport::Paused {
            self.transport = SongTransport::Playing;
        }
    }

    pub fn stop(&mut self) {
        self.transport = SongTransport::Idle;
    }

    pub fn seek_us(&mut self, position_us: u64) {
        self.stream.seek_to_start();
        self.pending_stream_event = None;
        self.playhead_us = position_us;
    }

    pub fn set_tempo_percent(&mut self, percent: u32) {
        self.tempo_percent = percent.clamp(25, 200);
    }

    pub fn set_transpose(&mut self, semitones: i32) {
        self.transpose = semitones.clamp(-24, 24);
    }

    pub fn set_loop(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(127);
    }

    pub fn mute_channel(&mut self, ch: u8) {
        if let Some(c) = self.channels.get_mut(ch as usize) {
            c.muted = true;
        }
    }

    pub fn unmute_channel(&mut self, ch: u8) {
        if let Some(c) = self.channels.get_mut(ch as usize) {
            c.muted = false;
        }
    }

    pub fn get_position_us(&self) -> u64 {
        self.playhead_us
    }

    /// Scales the declared length by the inverse of tempo so a host
    /// progress bar stays consistent across a mid-song tempo change.
    pub fn get_length_us(&self) -> Option<u64> {
        self.declared_length_us
            .map(|len| (len as u128 * 100 / self.tempo_percent as u128) as u64)
    }

    /// Queues a live event (direct host call or relayed MIDI-in) for
    /// dispatch on the next block.
    pub fn inject(&mut self, event: MidiEvent) {
        self.live_queue.push_back(event);
    }

    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        self.inject(MidiEvent::NoteOn { channel, note, velocity });
    }

    pub fn note_off(&mut self, channel: u8, note: u8) {
        self.inject(MidiEvent::NoteOff { channel, note, velocity: 0 });
    }

    pub fn controller(&mut self, channel: u8, controller: u8, value: u8) {
        self.inject(MidiEvent::Controller { channel, controller, value });
    }

    pub fn program_change(&mut self, channel: u8, program: u8) {
        self.inject(MidiEvent::ProgramChange { channel, program });
    }

    pub fn pitch_bend(&mut self, channel: u8, value: u16) {
        self.inject(MidiEvent::PitchBend { channel, value });
    }

    pub fn sysex(&mut self, data: Vec<u8>) {
        self.inject(MidiEvent::Sysex { data });
    }

    pub fn meta(&mut self, kind: MetaKind, payload: Vec<u8>) {
        self.inject(MidiEvent::Meta { kind, payload });
    }

    fn channel_mut(&mut self, ch: u8) -> &mut ChannelState {
        &mut self.channels[(ch as usize) % CHANNEL_COUNT]
    }

    fn dispatch(
        &mut self,
        event: MidiEvent,
        voices: &mut VoicePool,
        samples: &SampleCache,
        _block_end_us: u64,
    ) {
        match event {
            MidiEvent::NoteOn { channel, note, velocity } if velocity > 0 => {
                let ch = self.channel_mut(channel);
                if ch.muted {
                    return;
                }
                let (bank_msb, bank_lsb, program) = (ch.bank_msb, ch.bank_lsb, ch.program);
                let note_shifted = (note as i32 + self.transpose).clamp(0, 127) as u8;
                if let Some(instrument) =
                    samples.resolve(bank_msb, bank_lsb, program, note_shifted, velocity)
                {
                    let owner = VoiceOwner::Song {
                        song: self.id,
                        channel,
                    };
                    voices.allocate(owner, note_shifted, velocity, &instrument);
                } else {
                    debug!(
                        "no instrument resolvable for song {:?} ch {} program {}",
                        self.id, channel, program
                    );
                }
            }
            MidiEvent::NoteOn { channel, note, .. } | MidiEvent::NoteOff { channel, note, .. } => {
                let note_shifted = (note as i32 + self.transpose).clamp(0, 127) as u8;
                let owner = VoiceOwner::Song {
                    song: self.id,
                    channel,
                };
                let sustain = self.channel_mut(channel).sustain;
                if !sustain {
                    if let Some(voice) = voices.find_bound(owner, note_shifted) {
                        voice.note_off();
                    }
                }
            }
            MidiEvent::Controller { channel, controller, value } => {
                self.handle_controller(channel, controller, value, voices);
            }
            MidiEvent::ProgramChange { channel, program } => {
                self.channel_mut(channel).program = program;
            }
            MidiEvent::PitchBend { channel, value } => {
                self.channel_mut(channel).pitch_bend = value;
            }
            MidiEvent::Sysex { .. } => {
                trace!("sysex event ignored by core");
            }
            MidiEvent::Meta { kind, payload } => {
                if matches!(kind, MetaKind::Text | MetaKind::Lyric) {
                    trace!("meta event {:?} ({} bytes) forwarded to host", kind, payload.len());
                }
            }
        }
    }

    fn handle_controller(&mut self, channel: u8, cc: u8, value: u8, voices: &mut VoicePool) {
        match cc {
            0 => self.channel_mut(channel).bank_msb = value,
            32 => self.channel_mut(channel).bank_lsb = value,
            7 => self.channel_mut(channel).volume = value,
            10 => self.channel_mut(channel).pan = (value as i16 - 64).clamp(-63, 63) as i8,
            11 => self.channel_mut(channel).expression = value,
            1 => self.channel_mut(channel).modulation = value,
            64 => {
                let was_held = self.channel_mut(channel).sustain;
                let now_held = value >= 64;
                self.channel_mut(channel).sustain = now_held;
                if was_held && !now_held {
                    // Pedal released: sweep all pedal-held voices on
                    // this channel into `releasing`.
                    voices.release_channel(self.id, channel);
                }
            }
            91 => self.channel_mut(channel).reverb_send = value,
            93 => self.channel_mut(channel).chorus_send = value,
            120 => {
                let owner = VoiceOwner::Song {
                    song: self.id,
                    channel,
                };
                voices.terminate_owner(owner);
            }
            121 => {
                *self.channel_mut(channel) = ChannelState::default();
            }
            123 => voices.release_channel(self.id, channel),
            _ => {}
        }
    }

    /// Advances song time by one block and dispatches all events whose
    /// timestamp falls within it.
    pub fn advance_block(
        &mut self,
        frames: u32,
        sample_rate: u32,
        voices: &mut VoicePool,
        samples: &SampleCache,
        on_finished: &mut dyn FnMut(SongId),
    ) {
        if self.transport != SongTransport::Playing {
            return;
        }

        let block_us = (frames as u64 * 1_000_000 / sample_rate as u64) * 100
            / self.tempo_percent.max(1) as u64;
        let block_end = self.playhead_us + block_us;

        while let Some(event) = self.live_queue.pop_front() {
            self.dispatch(event, voices, samples, block_end);
        }

        loop {
            let next = self.pending_stream_event.take().or_else(|| self.stream.next_event());
            match next {
                Some((t_us, event)) if t_us <= block_end => {
                    self.dispatch(event, voices, samples, block_end);
                }
                Some(pushed_back) => {
                    self.pending_stream_event = Some(pushed_back);
                    break;
                }
                None => {
                    if self.loop_enabled {
                        self.stream.seek_to_start();
                        for ch in 0..CHANNEL_COUNT as u8 {
                            voices.release_channel(self.id, ch);
                        }
                        self.playhead_us = 0;
                    } else if !self.finished_fired
                        && self.all_voices_idle(voices)
                    {
                        self.finished_fired = true;
                        self.transport = SongTransport::Finished;
                        on_finished(self.id);
                    }
                    break;
                }
            }
        }

        self.playhead_us = block_end;
    }

    fn all_voices_idle(&self, voices: &VoicePool) -> bool {
        voices.voices().iter().all(|v| match v.owner() {
            Some(VoiceOwner::Song { song, .. }) if song == self.id => v.is_idle(),
            _ => true,
        })
    }

    pub fn render_contexts(&self, song_volume: f32, master_volume: f32) -> [FrameContext; CHANNEL_COUNT] {
        let mut out = [FrameContext::default(); CHANNEL_COUNT];
        for (i, ch) in self.channels.iter().enumerate() {
            out[i] = ch.to_frame_context(self.volume as f32 / 127.0 * song_volume, master_volume);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::SampleCache;
    use crate::voice::VoicePool;

    fn harness() -> (Song, VoicePool, SampleCache) {
        let song = Song::new(SongId(1), Box::new(LiveEventQueue::new()));
        let voices = VoicePool::new(8, 44100);
        let samples = SampleCache::new(44100);
        (song, voices, samples)
    }

    #[test]
    fn events_beyond_block_boundary_are_deferred_not_dropped() {
        let (mut song, mut voices, samples) = harness();
        // Replace the bound stream with a scripted one carrying two
        // widely separated events.
        let mut stream = LiveEventQueue::new();
        stream.push(0, MidiEvent::Controller { channel: 0, controller: 7, value: 1 });
        stream.push(100_000_000, MidiEvent::Controller { channel: 0, controller: 7, value: 99 });
        song.stream = Box::new(stream);
        song.start();

        let mut finished = Vec::new();
        // First block is ~10ms; the far event must not be consumed yet.
        song.advance_block(441, 44100, &mut voices, &samples, &mut |id| finished.push(id));
        assert_eq!(song.channels[0].volume, 1);
        assert!(song.pending_stream_event.is_some());

        // Jump the playhead far enough that the deferred event now falls
        // inside the block; it must still fire exactly once.
        song.playhead_us = 99_999_000;
        song.advance_block(441, 44100, &mut voices, &samples, &mut |id| finished.push(id));
        assert_eq!(song.channels[0].volume, 99);
        assert!(song.pending_stream_event.is_none());
    }

    #[test]
    fn seek_clears_pending_lookahead() {
        let (mut song, mut voices, samples) = harness();
        let mut stream = LiveEventQueue::new();
        stream.push(0, MidiEvent::Controller { channel: 0, controller: 7, value: 1 });
        stream.push(5_000_000, MidiEvent::Controller { channel: 0, controller: 7, value: 99 });
        song.stream = Box::new(stream);
        song.start();

        let mut finished = Vec::new();
        song.advance_block(441, 44100, &mut voices, &samples, &mut |id| finished.push(id));
        assert!(song.pending_stream_event.is_some());

        song.seek_us(0);
        assert!(song.pending_stream_event.is_none());
    }

    #[test]
    fn sustain_pedal_release_sweeps_held_notes() {
        let (mut song, mut voices, _samples) = harness();
        song.start();
        song.controller(0, 64, 127); // pedal down
        let mut finished = Vec::new();
        song.advance_block(64, 44100, &mut voices, &_samples, &mut |id| finished.push(id));
        assert!(song.channels[0].sustain);

        song.controller(0, 64, 0); // pedal up: must sweep held voices
        song.advance_block(64, 44100, &mut voices, &_samples, &mut |id| finished.push(id));
        assert!(!song.channels[0].sustain);
    }

    #[test]
    fn tempo_change_scales_reported_length() {
        let (mut song, _voices, _samples) = harness();
        song.declared_length_us = Some(10_000_000);
        song.set_tempo_percent(200);
        assert_eq!(song.get_length_us(), Some(5_000_000));
        song.set_tempo_percent(50);
        assert_eq!(song.get_length_us(), Some(20_000_000));
    }

    #[test]
    fn finished_fires_once_when_stream_exhausted_and_voices_idle() {
        let (mut song, mut voices, samples) = harness();
        song.start();
        let mut finished = Vec::new();
        for _ in 0..3 {
            song.advance_block(64, 44100, &mut voices, &samples, &mut |id| finished.push(id));
        }
        assert_eq!(finished, vec![SongId(1)]);
    }
}
