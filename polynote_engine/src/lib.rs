//! The complete audio-to-MIDI pipeline behind a single entry point.
//!
//! [`PitchTracker`] owns the three stages (spectral analysis, template
//! matching, note event scheduling) and drives them synchronously for each
//! incoming audio block. It is meant to be called from exactly one
//! real-time thread; see [`PitchTracker::process_block`] for the
//! reentrancy-drop behavior when that contract is violated.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use polynote_analysis::detector::{GuitarLayout, InstrumentType, NoteObserver};
use polynote_analysis::spectrum::SpectrumObserver;
use polynote_analysis::{PitchModel, SpectralAnalyzer, SpectralProfile};
use polynote_midi::{MidiEvent, NoteEventScheduler};

pub const DEFAULT_MAX_POLYPHONY: usize = 6;

/// Live audio-to-MIDI tracker: block in, note events out.
///
/// All processing happens synchronously inside
/// [`process_block`](Self::process_block); nothing blocks and nothing is
/// allocated on the steady-state path beyond the event output. Profile
/// save/load is not real-time safe and must only happen while no block is
/// being processed.
pub struct PitchTracker {
    analyzer: SpectralAnalyzer,
    model: PitchModel,
    scheduler: NoteEventScheduler,
    /// Reentrancy guard: a block arriving while another is still being
    /// analyzed is dropped, never queued.
    busy: AtomicBool,
}

impl PitchTracker {
    pub fn new(sample_rate: u32, fft_size: usize) -> Self {
        let analyzer = SpectralAnalyzer::new(fft_size);
        let mut scheduler = NoteEventScheduler::new(sample_rate);
        scheduler.set_samples_per_frame(analyzer.hop_size() as u32);

        Self {
            analyzer,
            model: PitchModel::new(DEFAULT_MAX_POLYPHONY),
            scheduler,
            busy: AtomicBool::new(false),
        }
    }

    /// Runs one block of mono samples through the pipeline. MIDI events are
    /// appended to `out` with timestamps relative to `block_start` (the
    /// absolute sample position of `samples[0]`).
    ///
    /// Returns true if at least one analysis frame completed. If another
    /// call is still in progress (a host misusing the single-threaded
    /// contract), the block is skipped entirely and false is returned.
    pub fn process_block(
        &mut self,
        samples: &[f32],
        out: &mut Vec<MidiEvent>,
        block_start: u64,
    ) -> bool {
        if self.busy.swap(true, Ordering::Acquire) {
            warn!("dropping audio block: analysis already in progress");
            return false;
        }

        let Self {
            analyzer,
            model,
            scheduler,
            ..
        } = self;
        let performed = analyzer.process_block(samples, |spectrum, offset| {
            let detected = model.process_spectrum(spectrum);
            scheduler.process_notes(&detected, out, block_start + offset as u64);
        });

        self.busy.store(false, Ordering::Release);
        performed
    }

    /// Releases all sounding notes and clears analysis state. The
    /// configuration is kept.
    pub fn reset(&mut self, out: &mut Vec<MidiEvent>, timestamp: u64) {
        self.analyzer.reset();
        self.scheduler.reset(out, timestamp);
    }

    pub fn set_fft_size(&mut self, fft_size: usize) {
        self.analyzer.set_fft_size(fft_size);
        self.scheduler
            .set_samples_per_frame(self.analyzer.hop_size() as u32);
    }

    pub fn fft_size(&self) -> usize {
        self.analyzer.fft_size()
    }

    pub fn set_overlap(&mut self, overlap: f32) {
        self.analyzer.set_overlap(overlap);
        self.scheduler
            .set_samples_per_frame(self.analyzer.hop_size() as u32);
    }

    pub fn hop_size(&self) -> usize {
        self.analyzer.hop_size()
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.scheduler.set_sample_rate(sample_rate);
    }

    pub fn set_learning_active(&mut self, active: bool) {
        self.model.set_learning_active(active);
    }

    pub fn is_learning_active(&self) -> bool {
        self.model.is_learning_active()
    }

    pub fn set_current_learning_note(&mut self, midi_note: Option<u8>) {
        self.model.set_current_learning_note(midi_note);
    }

    pub fn set_max_polyphony(&mut self, max_polyphony: usize) {
        self.model.set_max_polyphony(max_polyphony);
    }

    pub fn set_instrument_type(&mut self, instrument: InstrumentType) {
        self.model.set_instrument_type(instrument);
    }

    pub fn set_guitar_layout(&mut self, layout: GuitarLayout) {
        self.model.set_guitar_layout(layout);
    }

    /// See [`PitchModel::set_guitar_position`].
    pub fn set_guitar_position(&mut self, string_index: usize, fret: u8) -> u8 {
        self.model.set_guitar_position(string_index, fret)
    }

    pub fn set_midi_channel(&mut self, channel: u8) {
        self.scheduler.set_midi_channel(channel);
    }

    pub fn set_midi_velocity(&mut self, velocity: u8) {
        self.scheduler.set_midi_velocity(velocity);
    }

    pub fn set_note_on_delay_ms(&mut self, ms: u32) {
        self.scheduler.set_note_on_delay_ms(ms);
    }

    pub fn set_note_off_delay_ms(&mut self, ms: u32) {
        self.scheduler.set_note_off_delay_ms(ms);
    }

    /// Registers the spectrum tap (fired once per analysis frame).
    pub fn set_spectrum_observer(&mut self, observer: SpectrumObserver) {
        self.analyzer.set_spectrum_observer(observer);
    }

    /// Registers the detected-notes tap (fired on non-empty detections).
    pub fn set_note_observer(&mut self, observer: NoteObserver) {
        self.model.set_note_observer(observer);
    }

    pub fn is_ready_for_detection(&self) -> bool {
        self.model.is_ready_for_detection()
    }

    pub fn has_profile(&self, midi_note: u8) -> bool {
        self.model.has_profile(midi_note)
    }

    pub fn profiles(&self) -> &[SpectralProfile] {
        self.model.profiles()
    }

    pub fn remove_profile(&mut self, midi_note: u8) {
        self.model.remove_profile(midi_note);
    }

    pub fn clear_profiles(&mut self) {
        self.model.clear_profiles();
    }

    /// Not real-time safe; call only while no block is being processed.
    pub fn save_profiles(&self, path: &Path) -> io::Result<()> {
        self.model.save_profiles(path)
    }

    /// Not real-time safe; call only while no block is being processed.
    pub fn load_profiles(&mut self, path: &Path) -> io::Result<()> {
        self.model.load_profiles(path)
    }
}
