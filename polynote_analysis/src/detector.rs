use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use log::{debug, error, warn};

use crate::profile::{self, SpectralProfile};
use crate::util::{midi_note_name, normalize};

/// Number of spectra averaged into a note template before it is usable.
pub const REQUIRED_SPECTRA_FOR_LEARNING: usize = 10;

/// Candidates scoring below this cosine similarity are never reported.
pub const MIN_SIMILARITY: f32 = 0.1;

/// Candidates closer than this many semitones to an already selected note
/// are suppressed (octave aliases and smeared neighbors).
pub const MAX_SEMITONE_DISTANCE: u8 = 2;

pub const LOWEST_LEARNABLE_NOTE: u8 = 21;
pub const HIGHEST_LEARNABLE_NOTE: u8 = 108;
pub const MAX_POLYPHONY_LIMIT: usize = 16;

/// Reported for a guitar position on an out-of-range string index (middle C).
const FALLBACK_GUITAR_NOTE: u8 = 60;

/// Informational tag for the instrument whose templates are being learned.
/// Has no influence on the detection algorithm itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentType {
    Generic,
    Guitar,
    Piano,
    Bass,
}

#[derive(Debug, Clone)]
pub struct GuitarLayout {
    /// MIDI notes of the open strings, low to high.
    pub open_string_midi_notes: Vec<u8>,
    pub num_frets: u8,
}

impl Default for GuitarLayout {
    fn default() -> Self {
        Self {
            // standard tuning E2 A2 D3 G3 B3 E4
            open_string_midi_notes: vec![40, 45, 50, 55, 59, 64],
            num_frets: 24,
        }
    }
}

/// External consumer of detection results, called whenever a non-empty note
/// set is produced. Notes are in descending match-confidence order.
pub type NoteObserver = Box<dyn FnMut(&[u8]) + Send>;

/// Template-matching polyphonic pitch detector.
///
/// In learning mode, incoming magnitude spectra are normalized and
/// accumulated for the selected note; after
/// [`REQUIRED_SPECTRA_FOR_LEARNING`] spectra they are averaged into that
/// note's [`SpectralProfile`]. In detection mode, the incoming spectrum is
/// scored against every profile by cosine similarity and the best
/// non-conflicting notes are returned, bounded by the polyphony limit.
///
/// Detection keeps no history: the same spectrum always yields the same
/// note set.
pub struct PitchModel {
    learning_active: bool,
    current_learning_note: Option<u8>,
    max_polyphony: usize,

    instrument: InstrumentType,
    guitar: GuitarLayout,
    current_guitar_position: (u8, u8),

    profiles: Vec<SpectralProfile>,
    accumulators: BTreeMap<u8, Vec<Vec<f32>>>,

    observer: Option<NoteObserver>,

    /// Normalized copy of the incoming spectrum, reused across calls.
    scratch: Vec<f32>,
}

impl PitchModel {
    pub fn new(max_polyphony: usize) -> Self {
        Self {
            learning_active: false,
            current_learning_note: None,
            max_polyphony: max_polyphony.clamp(1, MAX_POLYPHONY_LIMIT),
            instrument: InstrumentType::Generic,
            guitar: GuitarLayout::default(),
            current_guitar_position: (0, 0),
            profiles: Vec::new(),
            accumulators: BTreeMap::new(),
            observer: None,
            scratch: Vec::new(),
        }
    }

    /// Feeds one magnitude spectrum. Returns the detected notes, always
    /// empty while learning mode is active or no templates exist yet.
    pub fn process_spectrum(&mut self, spectrum: &[f32]) -> BTreeSet<u8> {
        if spectrum.is_empty() {
            return BTreeSet::new();
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(spectrum);
        normalize(&mut self.scratch);

        if self.learning_active {
            if let Some(note) = self.current_learning_note {
                self.accumulate_learned_spectrum(note);
            }
            return BTreeSet::new();
        }

        if self.profiles.is_empty() {
            return BTreeSet::new();
        }

        self.detect_polyphonic_pitches()
    }

    fn accumulate_learned_spectrum(&mut self, note: u8) {
        let entries = self.accumulators.entry(note).or_default();
        entries.push(self.scratch.clone());
        if entries.len() < REQUIRED_SPECTRA_FOR_LEARNING {
            return;
        }

        let min_len = entries.iter().map(Vec::len).min().unwrap_or(0);
        let mut averaged = vec![0.0f32; min_len];
        for spectrum in entries.iter() {
            for (acc, x) in averaged.iter_mut().zip(spectrum.iter()) {
                *acc += x;
            }
        }
        let count = entries.len() as f32;
        for acc in averaged.iter_mut() {
            *acc /= count;
        }
        normalize(&mut averaged);

        let (guitar_string, guitar_fret) = if self.instrument == InstrumentType::Guitar {
            (
                Some(self.current_guitar_position.0),
                Some(self.current_guitar_position.1),
            )
        } else {
            (None, None)
        };

        // re-learning a note replaces its previous template
        self.profiles.retain(|p| p.midi_note != note);
        self.profiles.push(SpectralProfile {
            midi_note: note,
            spectrum: averaged,
            label: midi_note_name(note),
            guitar_string,
            guitar_fret,
        });
        self.accumulators.remove(&note);

        debug!("learned template for note {} ({})", note, midi_note_name(note));
    }

    fn detect_polyphonic_pitches(&mut self) -> BTreeSet<u8> {
        // cosine similarity against every template; both sides unit-norm
        let mut scored: Vec<(f32, u8)> = self
            .profiles
            .iter()
            .map(|p| {
                let similarity = p
                    .spectrum
                    .iter()
                    .zip(self.scratch.iter())
                    .map(|(a, b)| a * b)
                    .sum::<f32>();
                (similarity, p.midi_note)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut selected: Vec<u8> = Vec::new();
        for (score, note) in scored {
            if selected.len() >= self.max_polyphony {
                break;
            }
            // sorted descending, everything from here on is too weak
            if score < MIN_SIMILARITY {
                break;
            }
            let too_close = selected.iter().any(|&taken| {
                (taken as i16 - note as i16).unsigned_abs() < MAX_SEMITONE_DISTANCE as u16
            });
            if !too_close {
                selected.push(note);
            }
        }

        if !selected.is_empty() {
            if let Some(observer) = self.observer.as_mut() {
                let notes = selected.as_slice();
                if catch_unwind(AssertUnwindSafe(|| observer(notes))).is_err() {
                    error!("note observer panicked; suppressing");
                }
            }
        }

        selected.into_iter().collect()
    }

    pub fn set_learning_active(&mut self, active: bool) {
        self.learning_active = active;
    }

    pub fn is_learning_active(&self) -> bool {
        self.learning_active
    }

    /// Selects the note to learn, clamped to the piano range 21..=108.
    /// `None` clears the selection; spectra are then ignored while learning.
    pub fn set_current_learning_note(&mut self, midi_note: Option<u8>) {
        self.current_learning_note =
            midi_note.map(|n| n.clamp(LOWEST_LEARNABLE_NOTE, HIGHEST_LEARNABLE_NOTE));
    }

    pub fn current_learning_note(&self) -> Option<u8> {
        self.current_learning_note
    }

    pub fn set_max_polyphony(&mut self, max_polyphony: usize) {
        self.max_polyphony = max_polyphony.clamp(1, MAX_POLYPHONY_LIMIT);
    }

    pub fn max_polyphony(&self) -> usize {
        self.max_polyphony
    }

    pub fn set_instrument_type(&mut self, instrument: InstrumentType) {
        self.instrument = instrument;
    }

    pub fn instrument_type(&self) -> InstrumentType {
        self.instrument
    }

    pub fn set_guitar_layout(&mut self, layout: GuitarLayout) {
        self.guitar = layout;
    }

    pub fn guitar_layout(&self) -> &GuitarLayout {
        &self.guitar
    }

    /// Records the fretboard position being learned and returns its MIDI
    /// note, `open_string + fret`. An out-of-range string index falls back
    /// to middle C.
    pub fn set_guitar_position(&mut self, string_index: usize, fret: u8) -> u8 {
        self.current_guitar_position = (string_index as u8, fret);
        match self.guitar.open_string_midi_notes.get(string_index) {
            Some(&open) => open.saturating_add(fret),
            None => {
                warn!("invalid guitar string index {string_index}");
                FALLBACK_GUITAR_NOTE
            }
        }
    }

    pub fn current_guitar_position(&self) -> (u8, u8) {
        self.current_guitar_position
    }

    pub fn set_note_observer(&mut self, observer: NoteObserver) {
        self.observer = Some(observer);
    }

    /// True once at least one template exists.
    pub fn is_ready_for_detection(&self) -> bool {
        !self.profiles.is_empty()
    }

    pub fn has_profile(&self, midi_note: u8) -> bool {
        self.profiles.iter().any(|p| p.midi_note == midi_note)
    }

    pub fn profiles(&self) -> &[SpectralProfile] {
        &self.profiles
    }

    /// Drops the template and any partial learning state for one note.
    pub fn remove_profile(&mut self, midi_note: u8) {
        self.profiles.retain(|p| p.midi_note != midi_note);
        self.accumulators.remove(&midi_note);
    }

    pub fn clear_profiles(&mut self) {
        self.profiles.clear();
        self.accumulators.clear();
    }

    /// Writes all templates to `path`. Not real-time safe; must not run
    /// concurrently with `process_spectrum`.
    pub fn save_profiles(&self, path: &Path) -> io::Result<()> {
        profile::save_profiles(path, &self.profiles)
    }

    /// Replaces all templates with the contents of `path`. On any error the
    /// previously loaded templates remain fully intact. Not real-time safe.
    pub fn load_profiles(&mut self, path: &Path) -> io::Result<()> {
        let loaded = profile::load_profiles(path)?;
        self.profiles = loaded;
        self.accumulators.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECTRUM_LEN: usize = 64;

    fn impulse(bin: usize) -> Vec<f32> {
        let mut spectrum = vec![0.0; SPECTRUM_LEN];
        spectrum[bin] = 1.0;
        spectrum
    }

    fn learn(model: &mut PitchModel, note: u8, spectrum: &[f32]) {
        model.set_learning_active(true);
        model.set_current_learning_note(Some(note));
        for _ in 0..REQUIRED_SPECTRA_FOR_LEARNING {
            let detected = model.process_spectrum(spectrum);
            assert!(detected.is_empty(), "learning mode must detect nothing");
        }
        model.set_learning_active(false);
    }

    #[test]
    fn test_learning_creates_profile_after_required_count() {
        let mut model = PitchModel::new(6);
        model.set_learning_active(true);
        model.set_current_learning_note(Some(60));

        for _ in 0..REQUIRED_SPECTRA_FOR_LEARNING - 1 {
            model.process_spectrum(&impulse(5));
            assert!(!model.has_profile(60));
        }
        model.process_spectrum(&impulse(5));
        assert!(model.has_profile(60));

        // template of identical unit impulses is that impulse again
        let profile = &model.profiles()[0];
        assert_eq!(profile.spectrum, impulse(5));
        assert_eq!(profile.label, "C4");
    }

    #[test]
    fn test_learning_notes_independently() {
        let mut model = PitchModel::new(6);
        model.set_learning_active(true);

        // interleave two notes; each needs its own full set of spectra
        for _ in 0..REQUIRED_SPECTRA_FOR_LEARNING - 1 {
            model.set_current_learning_note(Some(60));
            model.process_spectrum(&impulse(5));
            model.set_current_learning_note(Some(67));
            model.process_spectrum(&impulse(20));
        }
        assert!(!model.has_profile(60));
        assert!(!model.has_profile(67));

        model.set_current_learning_note(Some(60));
        model.process_spectrum(&impulse(5));
        assert!(model.has_profile(60));
        assert!(!model.has_profile(67));

        model.set_current_learning_note(Some(67));
        model.process_spectrum(&impulse(20));
        assert!(model.has_profile(67));
    }

    #[test]
    fn test_relearning_replaces_profile() {
        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));
        learn(&mut model, 60, &impulse(9));
        assert_eq!(model.profiles().len(), 1);
        assert_eq!(model.profiles()[0].spectrum, impulse(9));
    }

    #[test]
    fn test_detects_learned_note() {
        let mut model = PitchModel::new(1);
        learn(&mut model, 60, &impulse(5));

        let detected = model.process_spectrum(&impulse(5));
        assert_eq!(detected, BTreeSet::from([60]));
    }

    #[test]
    fn test_detection_is_idempotent() {
        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));
        learn(&mut model, 67, &impulse(20));

        let mut mixed = impulse(5);
        mixed[20] = 0.8;
        let first = model.process_spectrum(&mixed);
        for _ in 0..5 {
            assert_eq!(model.process_spectrum(&mixed), first);
        }
    }

    #[test]
    fn test_no_detection_without_profiles() {
        let mut model = PitchModel::new(6);
        assert!(!model.is_ready_for_detection());
        assert!(model.process_spectrum(&impulse(5)).is_empty());
    }

    #[test]
    fn test_empty_spectrum_is_noop() {
        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));
        assert!(model.process_spectrum(&[]).is_empty());
    }

    #[test]
    fn test_dissimilar_spectrum_detects_nothing() {
        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));
        // orthogonal to the template, similarity 0 < MIN_SIMILARITY
        assert!(model.process_spectrum(&impulse(30)).is_empty());
    }

    #[test]
    fn test_polyphony_bound() {
        let mut model = PitchModel::new(2);
        learn(&mut model, 48, &impulse(4));
        learn(&mut model, 60, &impulse(16));
        learn(&mut model, 72, &impulse(40));

        let mut chord = vec![0.0; SPECTRUM_LEN];
        chord[4] = 1.0;
        chord[16] = 0.9;
        chord[40] = 0.8;
        let detected = model.process_spectrum(&chord);
        assert!(detected.len() <= 2);
        assert!(detected.contains(&48));
        assert!(detected.contains(&60));
    }

    #[test]
    fn test_semitone_suppression() {
        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(16));
        learn(&mut model, 61, &impulse(17));

        let mut smeared = vec![0.0; SPECTRUM_LEN];
        smeared[16] = 1.0;
        smeared[17] = 0.9;
        let detected = model.process_spectrum(&smeared);
        assert_eq!(detected, BTreeSet::from([60]));
    }

    #[test]
    fn test_note_observer_sees_detection() {
        use std::sync::{Arc, Mutex};

        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        model.set_note_observer(Box::new(move |notes| {
            seen_clone.lock().unwrap().push(notes.to_vec());
        }));

        model.process_spectrum(&impulse(5));
        assert_eq!(*seen.lock().unwrap(), vec![vec![60]]);
    }

    #[test]
    fn test_panicking_note_observer_is_contained() {
        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));
        model.set_note_observer(Box::new(|_| panic!("observer bug")));
        let detected = model.process_spectrum(&impulse(5));
        assert_eq!(detected, BTreeSet::from([60]));
    }

    #[test]
    fn test_configuration_clamping() {
        let mut model = PitchModel::new(0);
        assert_eq!(model.max_polyphony(), 1);
        model.set_max_polyphony(100);
        assert_eq!(model.max_polyphony(), MAX_POLYPHONY_LIMIT);

        model.set_current_learning_note(Some(0));
        assert_eq!(model.current_learning_note(), Some(LOWEST_LEARNABLE_NOTE));
        model.set_current_learning_note(Some(127));
        assert_eq!(model.current_learning_note(), Some(HIGHEST_LEARNABLE_NOTE));
    }

    #[test]
    fn test_guitar_position_to_midi_note() {
        let mut model = PitchModel::new(6);
        assert_eq!(model.set_guitar_position(0, 2), 42);
        assert_eq!(model.set_guitar_position(5, 0), 64);
        // invalid string index falls back to middle C
        assert_eq!(model.set_guitar_position(10, 3), 60);
    }

    #[test]
    fn test_failed_load_keeps_existing_profiles() {
        let path = std::env::temp_dir()
            .join(format!("polynote_detector_{}.bin", std::process::id()));
        std::fs::write(&path, b"garbage, not a profile file").unwrap();

        let mut model = PitchModel::new(6);
        learn(&mut model, 60, &impulse(5));
        assert!(model.load_profiles(&path).is_err());
        assert!(model.has_profile(60), "profiles must survive a failed load");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_guitar_profiles_carry_position() {
        let mut model = PitchModel::new(6);
        model.set_instrument_type(InstrumentType::Guitar);
        let note = model.set_guitar_position(2, 5);
        assert_eq!(note, 55);
        learn(&mut model, note, &impulse(12));

        let profile = &model.profiles()[0];
        assert_eq!(profile.guitar_string, Some(2));
        assert_eq!(profile.guitar_fret, Some(5));
    }
}
