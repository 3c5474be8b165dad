//! Debounced conversion of detected-note sets into MIDI note events.
//!
//! The detector reports a full set of sounding notes once per analysis
//! frame. [`NoteEventScheduler`] turns the transitions between consecutive
//! sets into note-on/note-off events while absorbing single-frame flicker:
//! a note must be seen in two consecutive frames before its note-on is sent,
//! and must stay absent for a configurable time before its note-off is sent.

use std::collections::{BTreeMap, BTreeSet};

use log::trace;

pub const DEFAULT_MIDI_CHANNEL: u8 = 1;
pub const DEFAULT_MIDI_VELOCITY: u8 = 100;
pub const DEFAULT_NOTE_ON_DELAY_MS: u32 = 50;
pub const DEFAULT_NOTE_OFF_DELAY_MS: u32 = 100;
pub const MAX_NOTE_DELAY_MS: u32 = 500;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MidiEventKind {
    /// Velocity is normalized to `[0, 1]` (configured velocity / 127).
    NoteOn { velocity: f32 },
    NoteOff,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    /// Absolute sample position of the analysis frame that produced this
    /// event.
    pub timestamp: u64,
    pub channel: u8,
    pub note: u8,
    pub kind: MidiEventKind,
}

/// State machine turning per-frame note sets into debounced MIDI events.
///
/// Invariants: a note is in at most one of `active` and `pending_on`;
/// every note in `pending_off` is still in `active` (its note-on has been
/// sent and its note-off has not).
///
/// The note-off debounce counts down in samples, decremented once per frame
/// by the analysis hop size, so the configured milliseconds are honored in
/// wall-clock terms. The note-on debounce is frame-granular: the first
/// sighting arms the note, the next consecutive sighting confirms it. The
/// note-on delay setter is part of the configuration surface but does not
/// stretch that confirmation beyond one frame.
pub struct NoteEventScheduler {
    channel: u8,
    velocity: u8,
    note_on_delay_ms: u32,
    note_off_delay_ms: u32,
    sample_rate: u32,
    /// Fresh samples per analysis frame; the countdown decrement.
    samples_per_frame: u32,
    off_delay_samples: i64,

    active: BTreeSet<u8>,
    pending_on: BTreeSet<u8>,
    /// note -> remaining samples until the note-off fires
    pending_off: BTreeMap<u8, i64>,
}

impl Default for NoteEventScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl NoteEventScheduler {
    pub fn new(sample_rate: u32) -> Self {
        let mut scheduler = Self {
            channel: DEFAULT_MIDI_CHANNEL,
            velocity: DEFAULT_MIDI_VELOCITY,
            note_on_delay_ms: DEFAULT_NOTE_ON_DELAY_MS,
            note_off_delay_ms: DEFAULT_NOTE_OFF_DELAY_MS,
            sample_rate: sample_rate.max(1),
            samples_per_frame: 1,
            off_delay_samples: 0,
            active: BTreeSet::new(),
            pending_on: BTreeSet::new(),
            pending_off: BTreeMap::new(),
        };
        scheduler.recompute_off_delay();
        scheduler
    }

    /// Consumes one frame's detected-note set and appends the resulting
    /// events to `out`, stamped with `timestamp` (in samples).
    pub fn process_notes(
        &mut self,
        detected: &BTreeSet<u8>,
        out: &mut Vec<MidiEvent>,
        timestamp: u64,
    ) {
        // 1. pending note-offs: a reappearing note cancels its note-off,
        //    everything else counts down and fires at zero
        let channel = self.channel;
        let active = &mut self.active;
        let decrement = self.samples_per_frame as i64;
        self.pending_off.retain(|&note, remaining| {
            if detected.contains(&note) {
                trace!("note {note} reappeared, canceling pending note-off");
                return false;
            }
            *remaining -= decrement;
            if *remaining > 0 {
                return true;
            }
            if active.remove(&note) {
                out.push(MidiEvent {
                    timestamp,
                    channel,
                    note,
                    kind: MidiEventKind::NoteOff,
                });
            }
            false
        });

        // 2. sounding notes that vanished start their off countdown
        for &note in self.active.iter() {
            if !detected.contains(&note) && !self.pending_off.contains_key(&note) {
                self.pending_off.insert(note, self.off_delay_samples);
            }
        }

        // 3. newly detected notes: arm on first sighting, confirm and send
        //    note-on on the second consecutive one
        for &note in detected {
            if self.active.contains(&note) {
                continue;
            }
            if self.pending_on.insert(note) {
                continue;
            }
            out.push(MidiEvent {
                timestamp,
                channel: self.channel,
                note,
                kind: MidiEventKind::NoteOn {
                    velocity: self.velocity as f32 / 127.0,
                },
            });
            self.active.insert(note);
            self.pending_on.remove(&note);
        }

        // 4. armed notes that vanished before confirmation are dropped
        self.pending_on.retain(|note| detected.contains(note));
    }

    /// Emits a note-off for every sounding note and clears all state.
    pub fn reset(&mut self, out: &mut Vec<MidiEvent>, timestamp: u64) {
        for &note in self.active.iter() {
            out.push(MidiEvent {
                timestamp,
                channel: self.channel,
                note,
                kind: MidiEventKind::NoteOff,
            });
        }
        self.active.clear();
        self.pending_on.clear();
        self.pending_off.clear();
    }

    pub fn set_midi_channel(&mut self, channel: u8) {
        self.channel = channel.clamp(1, 16);
    }

    pub fn midi_channel(&self) -> u8 {
        self.channel
    }

    pub fn set_midi_velocity(&mut self, velocity: u8) {
        self.velocity = velocity.min(127);
    }

    pub fn midi_velocity(&self) -> u8 {
        self.velocity
    }

    pub fn set_note_on_delay_ms(&mut self, ms: u32) {
        self.note_on_delay_ms = ms.min(MAX_NOTE_DELAY_MS);
    }

    pub fn note_on_delay_ms(&self) -> u32 {
        self.note_on_delay_ms
    }

    pub fn set_note_off_delay_ms(&mut self, ms: u32) {
        self.note_off_delay_ms = ms.min(MAX_NOTE_DELAY_MS);
        self.recompute_off_delay();
    }

    pub fn note_off_delay_ms(&self) -> u32 {
        self.note_off_delay_ms
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.recompute_off_delay();
    }

    /// Number of fresh samples per analysis frame (the analyzer hop size).
    /// Already pending note-offs keep their remaining countdown.
    pub fn set_samples_per_frame(&mut self, samples_per_frame: u32) {
        self.samples_per_frame = samples_per_frame.max(1);
    }

    pub fn active_notes(&self) -> &BTreeSet<u8> {
        &self.active
    }

    fn recompute_off_delay(&mut self) {
        self.off_delay_samples =
            (self.note_off_delay_ms as i64 * self.sample_rate as i64) / 1000;
    }
}
