//! Spectrum and level analysis
//!
//! `TapSource` wraps any `rodio::Source<Item=f32>` and captures a mono
//! sample window plus stereo peak levels while passing audio through
//! untouched. The engine tick reads the latest window through `TapHandle`
//! and turns it into a display frame with `SpectrumAnalyzer`: Hann window,
//! forward FFT, per-bin decibel conversion, bucket averaging into a fixed
//! bar count, then broadcast back to full half-spectrum resolution so
//! consumers always see the same frame size regardless of bar count.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::source::SeekError;
use rodio::Source;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::config::audio::{
    FFT_SIZE, MAGNITUDE_FLOOR, NOISE_FLOOR_DB, PEAK_FULL_SCALE, SILENCE_FLOOR_DB, SPECTRUM_BARS,
    SPECTRUM_BINS,
};

use super::types::SpectrumFrame;

/// Shared state written by the tap on the audio thread and read by the
/// engine tick
pub struct TapHandle {
    window: Mutex<[f32; FFT_SIZE]>,
    has_window: AtomicBool,
    /// Left peak in the high 16 bits, right peak in the low 16 bits,
    /// both scaled to 0..=32768
    packed_peak: AtomicU32,
    sample_count: AtomicU64,
    finished: AtomicBool,
}

impl Default for TapHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TapHandle {
    pub fn new() -> Self {
        Self {
            window: Mutex::new([0.0; FFT_SIZE]),
            has_window: AtomicBool::new(false),
            packed_peak: AtomicU32::new(0),
            sample_count: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Copy out the latest complete mono window, if one has been captured
    pub fn latest_window(&self) -> Option<[f32; FFT_SIZE]> {
        if !self.has_window.load(Ordering::Acquire) {
            return None;
        }
        self.window.lock().ok().map(|w| *w)
    }

    /// Latest stereo peak magnitudes, scaled to 0..=32768
    pub fn peak_levels(&self) -> (u16, u16) {
        split_peak(self.packed_peak.load(Ordering::Relaxed))
    }

    /// Interleaved samples pulled through the tap since attachment
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    /// Whether the wrapped source has been exhausted (genuine end of track)
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

fn pack_peak(left: u16, right: u16) -> u32 {
    ((left as u32) << 16) | right as u32
}

fn split_peak(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, (packed & 0xFFFF) as u16)
}

/// Convert a 16-bit peak magnitude to decibels full scale.
///
/// Zero is floored to −120 dB instead of computing log(0).
pub fn peak_to_db(magnitude: u16) -> f32 {
    if magnitude == 0 {
        return SILENCE_FLOOR_DB;
    }
    20.0 * (magnitude as f32 / PEAK_FULL_SCALE).log10()
}

/// Wrapper source capturing analysis data while passing samples through
pub struct TapSource<S> {
    inner: S,
    handle: Arc<TapHandle>,
    channels: u16,
    sample_rate: u32,
    window: Vec<f32>,
    frame_accum: f32,
    frame_cursor: u16,
    peak_left: f32,
    peak_right: f32,
    local_sample_count: u64,
}

impl<S> TapSource<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, handle: Arc<TapHandle>) -> Self {
        let channels = source.channels().max(1);
        let sample_rate = source.sample_rate();
        Self {
            inner: source,
            handle,
            channels,
            sample_rate,
            window: Vec::with_capacity(FFT_SIZE),
            frame_accum: 0.0,
            frame_cursor: 0,
            peak_left: 0.0,
            peak_right: 0.0,
            local_sample_count: 0,
        }
    }

    fn flush_window(&mut self) {
        if let Ok(mut shared) = self.handle.window.lock() {
            shared.copy_from_slice(&self.window);
        }
        self.handle.has_window.store(true, Ordering::Release);

        let left = (self.peak_left.min(1.0) * PEAK_FULL_SCALE) as u16;
        let right = (self.peak_right.min(1.0) * PEAK_FULL_SCALE) as u16;
        self.handle
            .packed_peak
            .store(pack_peak(left, right), Ordering::Relaxed);
        self.handle
            .sample_count
            .store(self.local_sample_count, Ordering::Relaxed);

        self.window.clear();
        self.peak_left = 0.0;
        self.peak_right = 0.0;
    }
}

impl<S> Iterator for TapSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(sample) = self.inner.next() else {
            self.handle.finished.store(true, Ordering::Release);
            return None;
        };
        self.local_sample_count += 1;

        match self.frame_cursor {
            0 => self.peak_left = self.peak_left.max(sample.abs()),
            1 => self.peak_right = self.peak_right.max(sample.abs()),
            _ => {}
        }
        if self.channels == 1 {
            self.peak_right = self.peak_left;
        }

        // Downmix one frame to mono for the transform window
        self.frame_accum += sample;
        self.frame_cursor += 1;
        if self.frame_cursor == self.channels {
            self.window.push(self.frame_accum / self.channels as f32);
            self.frame_accum = 0.0;
            self.frame_cursor = 0;

            if self.window.len() == FFT_SIZE {
                self.flush_window();
            }
        }

        Some(sample)
    }
}

impl<S> Source for TapSource<S>
where
    S: Source<Item = f32>,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        self.inner.try_seek(pos)?;
        self.window.clear();
        self.frame_accum = 0.0;
        self.frame_cursor = 0;
        // Invalidate the published window too, or the next tick would show
        // a pre-seek spectrum
        self.handle.has_window.store(false, Ordering::Release);
        Ok(())
    }
}

/// Turns captured sample windows into display frames.
///
/// Owned by the engine tick; holds the FFT plan so repeated ticks do not
/// re-plan.
pub struct SpectrumAnalyzer {
    planner: FftPlanner<f32>,
    scratch: Vec<Complex<f32>>,
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            scratch: Vec::with_capacity(FFT_SIZE),
        }
    }

    /// Full pipeline: window, transform, convert, bucket, broadcast
    pub fn analyze(&mut self, window: &[f32; FFT_SIZE]) -> SpectrumFrame {
        let fft = self.planner.plan_fft_forward(FFT_SIZE);

        self.scratch.clear();
        self.scratch
            .extend(window.iter().enumerate().map(|(i, &s)| {
                // Hann window
                let w = 0.5
                    * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / FFT_SIZE as f32).cos());
                Complex::new(s * w, 0.0)
            }));
        fft.process(&mut self.scratch);

        let converted = convert_bins(&self.scratch[..SPECTRUM_BINS]);
        let bars = bucket_average(&converted);
        SpectrumFrame {
            bins: broadcast_bars(&bars),
        }
    }
}

/// Per-bin conversion from complex transform output to display values.
///
/// `db = 20·log10(max(magnitude, 1e-5))`; bins below the noise floor are
/// zeroed, the rest map to `clamp01((db + 120)/120) · 0.5`.
pub fn convert_bins(raw: &[Complex<f32>]) -> [f32; SPECTRUM_BINS] {
    let norm = 2.0 / FFT_SIZE as f32;
    let mut out = [0.0f32; SPECTRUM_BINS];
    for (value, bin) in out.iter_mut().zip(raw.iter()) {
        let magnitude = bin.norm() * norm;
        let db = 20.0 * magnitude.max(MAGNITUDE_FLOOR).log10();
        if db < NOISE_FLOOR_DB {
            continue;
        }
        *value = ((db - SILENCE_FLOOR_DB) / -SILENCE_FLOOR_DB).clamp(0.0, 1.0) * 0.5;
    }
    out
}

/// Partition the converted bins into `SPECTRUM_BARS` contiguous equal-width
/// groups and average each; the last group absorbs any remainder bins.
pub fn bucket_average(bins: &[f32; SPECTRUM_BINS]) -> [f32; SPECTRUM_BARS] {
    let width = SPECTRUM_BINS / SPECTRUM_BARS;
    let mut bars = [0.0f32; SPECTRUM_BARS];
    for (bar, value) in bars.iter_mut().enumerate() {
        let start = bar * width;
        let end = if bar == SPECTRUM_BARS - 1 {
            SPECTRUM_BINS
        } else {
            start + width
        };
        let group = &bins[start..end];
        *value = group.iter().sum::<f32>() / group.len() as f32;
    }
    bars
}

/// Write each bar's averaged value back across all bins that fed it,
/// keeping the frame at full half-spectrum size for consumers.
pub fn broadcast_bars(bars: &[f32; SPECTRUM_BARS]) -> [f32; SPECTRUM_BINS] {
    let width = SPECTRUM_BINS / SPECTRUM_BARS;
    let mut bins = [0.0f32; SPECTRUM_BINS];
    for (i, value) in bins.iter_mut().enumerate() {
        let bar = (i / width).min(SPECTRUM_BARS - 1);
        *value = bars[bar];
    }
    bins
}
