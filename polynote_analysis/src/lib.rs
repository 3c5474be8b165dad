//! Headless spectral analysis and polyphonic pitch detection.
//!
//! This crate covers the first two stages of the pipeline: overlapping
//! windowed FFT analysis of a mono sample stream, and matching the resulting
//! magnitude spectra against learned per-note templates. It contains no
//! audio-device or MIDI code.

pub mod detector;
pub mod profile;
pub mod spectrum;
pub mod util;

pub use detector::PitchModel;
pub use profile::SpectralProfile;
pub use spectrum::SpectralAnalyzer;
