//! Headless microphone-to-MIDI runner.
//!
//! `polynote_live listen <profile.bin>` loads learned note templates and
//! prints the MIDI events detected from the default input device.
//! `polynote_live learn <midi_note> <profile.bin>` learns one note from the
//! microphone and saves the updated template file.

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use log::info;

use polynote_audio::AudioCapture;
use polynote_engine::PitchTracker;
use polynote_midi::{MidiEvent, MidiEventKind};

pub const SAMPLE_RATE: u32 = 44_100;
pub const FFT_SIZE: usize = 4096;

fn main() -> Result<()> {
    env_logger::init();

    let args = std::env::args().collect::<Vec<_>>();
    match args.get(1).map(String::as_str) {
        Some("listen") => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow!("missing profile file argument"))?;
            listen(Path::new(path))
        }
        Some("learn") => {
            let note = args
                .get(2)
                .ok_or_else(|| anyhow!("missing MIDI note argument"))?
                .parse::<u8>()?;
            let path = args
                .get(3)
                .ok_or_else(|| anyhow!("missing profile file argument"))?;
            learn(note, Path::new(path))
        }
        _ => {
            eprintln!("usage: polynote_live listen <profile.bin>");
            eprintln!("       polynote_live learn <midi_note> <profile.bin>");
            Ok(())
        }
    }
}

fn listen(profile_path: &Path) -> Result<()> {
    let capture = AudioCapture::new(SAMPLE_RATE)?;
    let mut tracker = PitchTracker::new(SAMPLE_RATE, FFT_SIZE);
    tracker.load_profiles(profile_path)?;
    if !tracker.is_ready_for_detection() {
        bail!("profile file contains no learned notes, run `learn` first");
    }
    info!(
        "loaded {} note templates from {}",
        tracker.profiles().len(),
        profile_path.display()
    );

    capture.play()?;

    let mut events: Vec<MidiEvent> = Vec::new();
    let mut clock: u64 = 0;
    loop {
        let block = capture.blocks().recv()?;
        tracker.process_block(&block, &mut events, clock);
        clock += block.len() as u64;

        for event in events.drain(..) {
            print_event(&event);
        }
    }
}

fn learn(midi_note: u8, profile_path: &Path) -> Result<()> {
    let capture = AudioCapture::new(SAMPLE_RATE)?;
    let mut tracker = PitchTracker::new(SAMPLE_RATE, FFT_SIZE);

    // keep previously learned notes if the file already exists
    if profile_path.exists() {
        tracker.load_profiles(profile_path)?;
        info!("extending existing profile file");
        // the loop below waits for this note's template to (re)appear
        tracker.remove_profile(midi_note);
    }

    tracker.set_learning_active(true);
    tracker.set_current_learning_note(Some(midi_note));

    capture.play()?;
    println!("play note {midi_note} and hold it...");

    let mut events: Vec<MidiEvent> = Vec::new();
    let mut clock: u64 = 0;
    while !tracker.has_profile(midi_note) {
        let block = capture.blocks().recv()?;
        tracker.process_block(&block, &mut events, clock);
        clock += block.len() as u64;
    }

    tracker.set_learning_active(false);
    tracker.save_profiles(profile_path)?;
    println!("learned note {midi_note}, saved to {}", profile_path.display());
    Ok(())
}

fn print_event(event: &MidiEvent) {
    match event.kind {
        MidiEventKind::NoteOn { velocity } => println!(
            "{:>10}  note-on  ch={:<2} note={:<3} vel={:.2}",
            event.timestamp, event.channel, event.note, velocity
        ),
        MidiEventKind::NoteOff => println!(
            "{:>10}  note-off ch={:<2} note={:<3}",
            event.timestamp, event.channel, event.note
        ),
    }
}
