//! Live MIDI hardware input via `midir`, relayed into the command ring
//! as `ControlCommand::SongEvent`s targeting a chosen Song.

use super::MidiEvent;
use crate::command::{ControlCommand, ControlHandle, SongId};
use midir::{MidiInput, MidiInputConnection};
use std::error::Error;

pub struct MidiHandler {
    _connection: Option<MidiInputConnection<()>>,
}

impl MidiHandler {
    /// Connects to the first available MIDI input port and relays
    /// every message it produces into `control` as events targeting
    /// `target_song`. Returns a handler with no open port (and thus no
    /// events) if none is available.
    pub fn new(control: ControlHandle, target_song: SongId) -> Result<Self, Box<dyn Error>> {
        let midi_in = MidiInput::new("engine MIDI input")?;
        let ports = midi_in.ports();

        let connection = if let Some(port) = ports.first() {
            let port_name = midi_in.port_name(port)?;
            log::info!("connecting to MIDI input port: {port_name}");

            Some(midi_in.connect(
                port,
                "engine-input",
                move |_timestamp, message, _| {
                    if let Some(event) = parse_midi_message(message) {
                        control.send(ControlCommand::SongEvent {
                            song: target_song,
                            event,
                        });
                    }
                },
                (),
            )?)
        } else {
            log::warn!("no MIDI input ports available");
            None
        };

        Ok(Self {
            _connection: connection,
        })
    }

    pub fn list_ports() -> Result<Vec<String>, Box<dyn Error>> {
        let midi_in = MidiInput::new("engine MIDI input")?;
        let ports = midi_in.ports();
        ports
            .iter()
            .map(|p| midi_in.port_name(p).map_err(|e| e.into()))
            .collect()
    }
}

/// Parses a raw MIDI 1.0 byte triple/pair into the engine's event type.
/// Running status and SysEx framing are left to the host's transport;
/// this only handles single, complete channel-voice messages.
fn parse_midi_message(message: &[u8]) -> Option<MidiEvent> {
    if message.len() < 2 {
        return None;
    }
    let status = message[0];
    let channel = status & 0x0F;
    let kind = status & 0xF0;

    match kind {
        0x90 if message.len() >= 3 => {
            let (note, velocity) = (message[1], message[2]);
            if velocity == 0 {
                Some(MidiEvent::NoteOff { channel, note, velocity: 0 })
            } else {
                Some(MidiEvent::NoteOn { channel, note, velocity })
            }
        }
        0x80 if message.len() >= 3 => Some(MidiEvent::NoteOff {
            channel,
            note: message[1],
            velocity: message[2],
        }),
        0xB0 if message.len() >= 3 => Some(MidiEvent::Controller {
            channel,
            controller: message[1],
            value: message[2],
        }),
        0xC0 if message.len() >= 2 => Some(MidiEvent::ProgramChange {
            channel,
            program: message[1],
        }),
        0xE0 if message.len() >= 3 => {
            let value = (message[1] as u16) | ((message[2] as u16) << 7);
            Some(MidiEvent::PitchBend { channel, value })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_note_on() {
        let event = parse_midi_message(&[0x90, 60, 100]);
        assert_eq!(
            event,
            Some(MidiEvent::NoteOn { channel: 0, note: 60, velocity: 100 })
        );
    }

    #[test]
    fn note_on_zero_velocity_is_note_off() {
        let event = parse_midi_message(&[0x90, 60, 0]);
        assert_eq!(event, Some(MidiEvent::NoteOff { channel: 0, note: 60, velocity: 0 }));
    }

    #[test]
    fn parses_pitch_bend_as_14_bit() {
        let event = parse_midi_message(&[0xE1, 0x00, 0x40]);
        assert_eq!(event, Some(MidiEvent::PitchBend { channel: 1, value: 8192 }));
    }

    #[test]
    fn invalid_message_is_none() {
        assert_eq!(parse_midi_message(&[0xFF]), None);
    }
}
