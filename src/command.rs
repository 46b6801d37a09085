//! The control-thread → audio-thread command ring.
//!
//! Control operations that can't complete as a single atomic field
//! write are queued here and drained by `Mixer::render_block` at the
//! start of each block, in FIFO order.

use crate::bank::BankToken;
use crate::midi::MidiEvent;
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SongId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SoundId(pub u32);

#[derive(Debug, Clone)]
pub enum ControlCommand {
    SongEvent { song: SongId, event: MidiEvent },
    SongStart { song: SongId },
    SongStop { song: SongId },
    SongSeek { song: SongId, position_us: u64 },
    SongDelete { song: SongId, generation: u64 },
    SoundStart { sound: SoundId },
    SoundStop { sound: SoundId },
    SoundDelete { sound: SoundId, generation: u64 },
    UnloadBank { token: BankToken, generation: u64 },
}

const RING_CAPACITY: usize = 1024;

/// Control-thread handle: clone freely, `try_send` never blocks.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlCommand>,
}

impl ControlHandle {
    /// Enqueues a command. Returns `false` if the ring is full — the
    /// caller should treat this as the audio thread falling behind and
    /// retry or drop the event.
    pub fn send(&self, cmd: ControlCommand) -> bool {
        self.tx.try_send(cmd).is_ok()
    }
}

/// Audio-thread side: owned by the `Mixer`, drained once per block.
pub struct CommandRing {
    rx: Receiver<ControlCommand>,
    tx: Sender<ControlCommand>,
}

impl CommandRing {
    pub fn new() -> Self {
        let (tx, rx) = bounded(RING_CAPACITY);
        Self { rx, tx }
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drains all currently-queued commands in FIFO order. Never
    /// blocks; safe to call from the audio thread.
    pub fn drain(&self, mut f: impl FnMut(ControlCommand)) {
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => f(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

impl Default for CommandRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_ordering_preserved() {
        let ring = CommandRing::new();
        let handle = ring.handle();
        handle.send(ControlCommand::SongStart { song: SongId(1) });
        handle.send(ControlCommand::SongStop { song: SongId(1) });

        let mut seen = Vec::new();
        ring.drain(|cmd| seen.push(format!("{:?}", cmd)));
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("SongStart"));
        assert!(seen[1].contains("SongStop"));
    }

    #[test]
    fn drain_is_nonblocking_when_empty() {
        let ring = CommandRing::new();
        let mut count = 0;
        ring.drain(|_| count += 1);
        assert_eq!(count, 0);
    }
}
