//! Demo host for the synthesis engine: loads one instrument bank,
//! opens the default audio output, optionally relays live MIDI input
//! into a single Song, and plays a test note if no MIDI source is
//! available.

use clap::Parser;
use dsynth::audio::output::AudioOutput;
use dsynth::mixer::{Mixer, MixerConfig};
use dsynth::song::LiveEventQueue;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dsynth", about = "MIDI synthesis and mixing engine demo host")]
struct Args {
    /// Instrument bank to load (.dls, .sf2, or native .baeb)
    #[arg(long)]
    bank: Option<PathBuf>,

    /// Output sample rate
    #[arg(long, default_value_t = 44100)]
    sample_rate: u32,

    /// Maximum simultaneous Song voices
    #[arg(long, default_value_t = 32)]
    max_song_voices: usize,

    /// Maximum simultaneous Sounds
    #[arg(long, default_value_t = 8)]
    max_sound_voices: usize,

    /// Relay live MIDI hardware input into the demo Song
    #[arg(long)]
    midi_in: bool,

    /// Skip the startup test note
    #[arg(long)]
    no_test_note: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut mixer = Mixer::open(MixerConfig {
        sample_rate: args.sample_rate,
        max_song_voices: args.max_song_voices,
        max_sound_voices: args.max_sound_voices,
        mix_level: 1.0,
    });

    if let Some(path) = &args.bank {
        let bytes = std::fs::read(path)?;
        let token = match path.extension().and_then(|e| e.to_str()) {
            Some("sf2") => mixer.load_sf2_bank(&bytes),
            Some("dls") => mixer.load_dls_bank(&bytes),
            _ => mixer.load_native_bank(&bytes),
        }?;
        log::info!("loaded bank {:?} from {}", token, path.display());
    } else {
        log::warn!("no --bank given; resolve() will return None for every note");
    }

    let song_id = mixer.add_song(Box::new(LiveEventQueue::new()));
    if let Some(song) = mixer.song_mut(song_id) {
        song.start();
    }
    let control = mixer.control_handle();

    let _midi_handler = if args.midi_in {
        match dsynth::midi::handler::MidiHandler::new(control.clone(), song_id) {
            Ok(handler) => Some(handler),
            Err(e) => {
                log::warn!("MIDI input unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let audio = AudioOutput::new(mixer).map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    log::info!("audio output running at {} Hz", audio.sample_rate());

    if !args.no_test_note {
        control.send(dsynth::command::ControlCommand::SongEvent {
            song: song_id,
            event: dsynth::midi::MidiEvent::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100,
            },
        });
    }

    println!("Engine running. Press Enter to quit.");
    let mut buf = [0u8; 1];
    let _ = std::io::stdin().read(&mut buf);

    Ok(())
}
