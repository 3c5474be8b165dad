use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;
use num_complex::Complex32;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftPlanner};

pub const DEFAULT_FFT_SIZE: usize = 4096;
pub const DEFAULT_OVERLAP: f32 = 0.5;

/// Overlap factors above this would make the hop size collapse towards zero.
pub const MAX_OVERLAP: f32 = 0.95;

/// External consumer of freshly computed magnitude spectra. The slice is only
/// valid for the duration of the call; consumers must copy what they keep.
pub type SpectrumObserver = Box<dyn FnMut(&[f32]) + Send>;

/// Windowed overlapping FFT analysis of a mono sample stream.
///
/// Samples are accumulated into a window of `fft_size` samples. Each time the
/// window fills up, a Hann window is applied, a forward FFT is taken and the
/// magnitude spectrum (`fft_size / 2` bins) is handed to the sink closure of
/// [`SpectralAnalyzer::process_block`] and to the registered observer. The
/// window is then shifted left by the hop size, so consecutive analyses
/// overlap by `overlap * fft_size` samples.
///
/// All buffers and the FFT plan are allocated up front; the per-block path
/// does not allocate.
pub struct SpectralAnalyzer {
    fft_size: usize,
    overlap: f32,
    hop_size: usize,

    /// Linear accumulation window; `cursor` is the write position and never
    /// exceeds `fft_size`.
    window: Vec<f32>,
    cursor: usize,

    hann: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_buffer: Vec<Complex32>,
    fft_scratch: Vec<Complex32>,
    magnitudes: Vec<f32>,

    observer: Option<SpectrumObserver>,
}

impl SpectralAnalyzer {
    /// `fft_size` must be a power of two.
    pub fn new(fft_size: usize) -> Self {
        assert!(fft_size.is_power_of_two(), "fft size must be a power of two");

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        let mut analyzer = Self {
            fft_size,
            overlap: DEFAULT_OVERLAP,
            hop_size: 1,
            window: vec![0.0; fft_size],
            cursor: 0,
            hann: apodize::hanning_iter(fft_size)
                .map(|x| x as f32)
                .collect::<Vec<f32>>(),
            fft,
            fft_buffer: vec![Complex32::zero(); fft_size],
            fft_scratch: vec![Complex32::zero(); scratch_len],
            magnitudes: vec![0.0; fft_size / 2],
            observer: None,
        };
        analyzer.recompute_hop_size();
        analyzer
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of bins in the magnitude spectrum, `fft_size / 2`.
    pub fn spectrum_size(&self) -> usize {
        self.fft_size / 2
    }

    /// Number of fresh samples consumed between consecutive analyses.
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn overlap(&self) -> f32 {
        self.overlap
    }

    /// The most recent magnitude spectrum. All zeros before the first
    /// analysis or after a [`reset`](Self::reset).
    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }

    /// Sets the overlap factor, silently clamped to `[0, MAX_OVERLAP]`, and
    /// recomputes the hop size.
    pub fn set_overlap(&mut self, overlap: f32) {
        self.overlap = overlap.clamp(0.0, MAX_OVERLAP);
        self.recompute_hop_size();
    }

    /// Changes the FFT size. This reallocates all buffers and discards any
    /// accumulated in-flight samples.
    pub fn set_fft_size(&mut self, fft_size: usize) {
        assert!(fft_size.is_power_of_two(), "fft size must be a power of two");
        if fft_size == self.fft_size {
            return;
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        self.fft_size = fft_size;
        self.window = vec![0.0; fft_size];
        self.cursor = 0;
        self.hann = apodize::hanning_iter(fft_size)
            .map(|x| x as f32)
            .collect::<Vec<f32>>();
        self.fft = fft;
        self.fft_buffer = vec![Complex32::zero(); fft_size];
        self.fft_scratch = vec![Complex32::zero(); scratch_len];
        self.magnitudes = vec![0.0; fft_size / 2];
        self.recompute_hop_size();
    }

    /// Registers the external spectrum tap. A panic inside the observer is
    /// caught and logged; it never unwinds into the audio path.
    pub fn set_spectrum_observer(&mut self, observer: SpectrumObserver) {
        self.observer = Some(observer);
    }

    /// Zeroes all buffers and the write cursor without touching the
    /// configuration.
    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.fft_buffer.fill(Complex32::zero());
        self.magnitudes.fill(0.0);
        self.cursor = 0;
    }

    /// Feeds a block of mono samples. `sink` is invoked once per completed
    /// analysis with the magnitude spectrum and the in-block index of the
    /// sample that filled the window; a long block can complete several
    /// analyses. Returns true if at least one analysis ran.
    pub fn process_block(
        &mut self,
        samples: &[f32],
        mut sink: impl FnMut(&[f32], usize),
    ) -> bool {
        let mut performed = false;

        for (i, &sample) in samples.iter().enumerate() {
            self.window[self.cursor] = sample;
            self.cursor += 1;

            if self.cursor == self.fft_size {
                self.analyze();
                sink(&self.magnitudes, i);

                // keep the overlapping tail for the next analysis
                self.window.copy_within(self.hop_size.., 0);
                self.cursor = self.fft_size - self.hop_size;
                performed = true;
            }
        }

        performed
    }

    fn analyze(&mut self) {
        for ((out, &x), &w) in self
            .fft_buffer
            .iter_mut()
            .zip(self.window.iter())
            .zip(self.hann.iter())
        {
            *out = Complex32::new(x * w, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.fft_buffer, &mut self.fft_scratch);

        for (mag, c) in self
            .magnitudes
            .iter_mut()
            .zip(self.fft_buffer.iter().take(self.fft_size / 2))
        {
            *mag = c.norm();
        }

        if let Some(observer) = self.observer.as_mut() {
            let magnitudes = &self.magnitudes;
            if catch_unwind(AssertUnwindSafe(|| observer(magnitudes))).is_err() {
                error!("spectrum observer panicked; suppressing");
            }
        }
    }

    fn recompute_hop_size(&mut self) {
        self.hop_size =
            ((self.fft_size as f32 * (1.0 - self.overlap)) as usize).max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::arg_max;
    use std::f32::consts::PI;

    fn sine(freq_bin: usize, fft_size: usize, len: usize) -> Vec<f32> {
        // frequency placed exactly on a bin center of the analysis window
        (0..len)
            .map(|i| (2.0 * PI * freq_bin as f32 * i as f32 / fft_size as f32).sin())
            .collect()
    }

    #[test]
    fn test_no_analysis_until_window_full() {
        let mut analyzer = SpectralAnalyzer::new(256);
        let mut count = 0;
        let performed = analyzer.process_block(&vec![0.1; 255], |_, _| count += 1);
        assert!(!performed);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_empty_block_is_noop() {
        let mut analyzer = SpectralAnalyzer::new(256);
        assert!(!analyzer.process_block(&[], |_, _| panic!("no analysis expected")));
    }

    #[test]
    fn test_one_analysis_per_hop() {
        let fft_size = 256;
        let mut analyzer = SpectralAnalyzer::new(fft_size);
        analyzer.set_overlap(0.5);
        let hop = analyzer.hop_size();
        assert_eq!(hop, 128);

        // first fill plus k further hops => k + 1 analyses
        let k = 7;
        let mut spectra = 0;
        let mut lengths_ok = true;
        let performed = analyzer.process_block(
            &vec![0.25; fft_size + k * hop],
            |spectrum, _| {
                spectra += 1;
                lengths_ok &= spectrum.len() == fft_size / 2;
            },
        );
        assert!(performed);
        assert_eq!(spectra, k + 1);
        assert!(lengths_ok);
    }

    #[test]
    fn test_zero_overlap_hop_equals_fft_size() {
        let mut analyzer = SpectralAnalyzer::new(512);
        analyzer.set_overlap(0.0);
        assert_eq!(analyzer.hop_size(), 512);

        let mut spectra = 0;
        analyzer.process_block(&vec![0.5; 512 * 3], |_, _| spectra += 1);
        assert_eq!(spectra, 3);
    }

    #[test]
    fn test_overlap_is_clamped() {
        let mut analyzer = SpectralAnalyzer::new(256);
        analyzer.set_overlap(2.0);
        assert_eq!(analyzer.overlap(), MAX_OVERLAP);
        assert!(analyzer.hop_size() >= 1);
        analyzer.set_overlap(-1.0);
        assert_eq!(analyzer.overlap(), 0.0);
    }

    #[test]
    fn test_sine_peaks_at_expected_bin() {
        let fft_size = 1024;
        let bin = 10;
        let mut analyzer = SpectralAnalyzer::new(fft_size);

        let mut peak_bin = None;
        analyzer.process_block(&sine(bin, fft_size, fft_size), |spectrum, _| {
            peak_bin = Some(arg_max(spectrum));
        });
        assert_eq!(peak_bin, Some(bin));
    }

    #[test]
    fn test_sink_offset_marks_completing_sample() {
        let fft_size = 256;
        let mut analyzer = SpectralAnalyzer::new(fft_size);
        analyzer.set_overlap(0.5);

        let mut offsets = Vec::new();
        analyzer.process_block(&vec![0.1; 512], |_, offset| offsets.push(offset));
        // window fills at sample 255, then every 128 samples
        assert_eq!(offsets, vec![255, 383, 511]);
    }

    #[test]
    fn test_reset_discards_in_flight_samples() {
        let fft_size = 256;
        let mut analyzer = SpectralAnalyzer::new(fft_size);
        analyzer.process_block(&vec![0.7; 200], |_, _| {});
        analyzer.reset();

        let mut spectra = 0;
        analyzer.process_block(&vec![0.7; 100], |_, _| spectra += 1);
        assert_eq!(spectra, 0);

        analyzer.process_block(&vec![0.7; 156], |_, _| spectra += 1);
        assert_eq!(spectra, 1);
    }

    #[test]
    fn test_set_fft_size_reallocates() {
        let mut analyzer = SpectralAnalyzer::new(256);
        analyzer.process_block(&vec![0.3; 200], |_, _| {});
        analyzer.set_fft_size(1024);
        assert_eq!(analyzer.spectrum_size(), 512);

        // in-flight state was discarded, a full window is needed again
        let mut spectra = 0;
        analyzer.process_block(&vec![0.3; 1023], |_, _| spectra += 1);
        assert_eq!(spectra, 0);
        analyzer.process_block(&[0.3], |_, _| spectra += 1);
        assert_eq!(spectra, 1);
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let mut analyzer = SpectralAnalyzer::new(256);
        analyzer.set_spectrum_observer(Box::new(|_| panic!("observer bug")));

        let mut spectra = 0;
        let performed = analyzer.process_block(&vec![0.2; 256], |_, _| spectra += 1);
        assert!(performed);
        assert_eq!(spectra, 1);
    }
}
