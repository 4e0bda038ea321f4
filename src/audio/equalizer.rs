//! Multi-band parametric equalizer
//!
//! Ten peaking bands at fixed ISO-like centers. Band values outlive any
//! individual stream: only the filter attachment is torn down and rebuilt
//! per track. `EqualizedSource` wraps the decode source and runs one biquad
//! section per active band per channel; live gain changes cross over via
//! atomic gain bits plus a generation counter and are picked up at block
//! boundaries, never per sample.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type};
use rodio::source::SeekError;
use rodio::Source;
use tracing::{debug, warn};

use crate::config::equalizer::{
    BAND_CENTERS_HZ, BAND_COUNT, CENTER_MATCH_TOLERANCE_HZ, DEFAULT_BANDWIDTH_OCT,
    REFRESH_INTERVAL_SAMPLES,
};

use super::math::{bandwidth_octaves_to_q, clamp_gain_db};

/// One parametric peaking band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub center_hz: f32,
    pub gain_db: f32,
    pub bandwidth_oct: f32,
}

impl EqBand {
    /// A flat (0 dB) band at the given center
    pub fn flat(center_hz: f32) -> Self {
        Self {
            center_hz,
            gain_db: 0.0,
            bandwidth_oct: DEFAULT_BANDWIDTH_OCT,
        }
    }
}

/// The standard flat 10-band curve
pub fn default_bands() -> [EqBand; BAND_COUNT] {
    BAND_CENTERS_HZ.map(EqBand::flat)
}

/// Gains shared between the caller side and the audio thread
struct EqControl {
    gain_bits: [AtomicU32; BAND_COUNT],
    generation: AtomicU64,
}

impl EqControl {
    fn new(bands: &[EqBand; BAND_COUNT]) -> Self {
        Self {
            gain_bits: std::array::from_fn(|i| AtomicU32::new(bands[i].gain_db.to_bits())),
            generation: AtomicU64::new(0),
        }
    }

    fn set_gain(&self, index: usize, gain_db: f32) {
        self.gain_bits[index].store(gain_db.to_bits(), Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn gain(&self, index: usize) -> f32 {
        f32::from_bits(self.gain_bits[index].load(Ordering::Relaxed))
    }
}

/// Equalizer component owned by the engine.
///
/// Holds the band values and, while a stream is live, a handle to the
/// filter sections attached to it.
pub struct Equalizer {
    bands: [EqBand; BAND_COUNT],
    control: Option<Arc<EqControl>>,
    active: [bool; BAND_COUNT],
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Equalizer {
    pub fn new() -> Self {
        Self {
            bands: default_bands(),
            control: None,
            active: [false; BAND_COUNT],
        }
    }

    /// The stored band values (persisted independently of attachment)
    pub fn bands(&self) -> &[EqBand] {
        &self.bands
    }

    /// Replace the whole band list, e.g. restoring a saved curve.
    ///
    /// Extra entries are ignored; missing entries keep their current value.
    /// Gains are clamped. Takes effect on the live stream immediately where
    /// the matching band is active.
    pub fn set_bands(&mut self, bands: &[EqBand]) {
        for (i, band) in bands.iter().take(BAND_COUNT).enumerate() {
            self.bands[i] = EqBand {
                center_hz: self.bands[i].center_hz,
                gain_db: clamp_gain_db(band.gain_db),
                bandwidth_oct: if band.bandwidth_oct > 0.0 {
                    band.bandwidth_oct
                } else {
                    DEFAULT_BANDWIDTH_OCT
                },
            };
            if let Some(ref control) = self.control {
                if self.active[i] {
                    control.set_gain(i, self.bands[i].gain_db);
                }
            }
        }
    }

    /// Update one band's gain, matched by center frequency.
    ///
    /// The stored gain always updates (clamped) so a curve chosen before any
    /// track is loaded survives. Pushing the change into a live stream is a
    /// silent no-op when nothing is attached or the band failed to activate.
    pub fn set_band_gain(&mut self, center_hz: f32, gain_db: f32) {
        let Some(index) = self.band_index(center_hz) else {
            debug!(center_hz, "no equalizer band at this frequency");
            return;
        };
        self.set_band_gain_at(index, gain_db);
    }

    /// Update one band's gain by its position in the fixed band list.
    /// Out-of-range indices are a silent no-op.
    pub fn set_band_gain_at(&mut self, index: usize, gain_db: f32) {
        if index >= BAND_COUNT {
            debug!(index, "no equalizer band at this index");
            return;
        }
        let gain = clamp_gain_db(gain_db);
        self.bands[index].gain_db = gain;

        if let Some(ref control) = self.control {
            if self.active[index] {
                control.set_gain(index, gain);
            }
        }
    }

    /// Find a band by exact center match within tolerance
    pub fn band_index(&self, center_hz: f32) -> Option<usize> {
        self.bands
            .iter()
            .position(|b| (b.center_hz - center_hz).abs() <= CENTER_MATCH_TOLERANCE_HZ)
    }

    /// Whether filter sections are currently attached to a stream
    pub fn is_attached(&self) -> bool {
        self.control.is_some()
    }

    /// Attach the band set to a new stream by wrapping its source.
    ///
    /// Bands whose coefficients cannot be derived for this sample rate
    /// (e.g. center above Nyquist) are logged and left inactive; the rest
    /// still activate. Returns the wrapped source and `true` iff at least
    /// one band activated.
    pub fn attach<S>(&mut self, source: S) -> (EqualizedSource<S>, bool)
    where
        S: Source<Item = f32>,
    {
        let sample_rate = source.sample_rate();
        let channels = source.channels().max(1) as usize;
        let control = Arc::new(EqControl::new(&self.bands));

        let mut sections = Vec::with_capacity(BAND_COUNT);
        let mut active = [false; BAND_COUNT];
        for (i, band) in self.bands.iter().enumerate() {
            let q = bandwidth_octaves_to_q(band.bandwidth_oct);
            match Coefficients::<f32>::from_params(
                Type::PeakingEQ(band.gain_db),
                (sample_rate as f32).hz(),
                band.center_hz.hz(),
                q,
            ) {
                Ok(coeffs) => {
                    active[i] = true;
                    sections.push(BandSection {
                        band_index: i,
                        center_hz: band.center_hz,
                        q,
                        gain_db: band.gain_db,
                        filters: (0..channels).map(|_| DirectForm1::<f32>::new(coeffs)).collect(),
                    });
                }
                Err(e) => {
                    warn!(
                        center_hz = band.center_hz,
                        sample_rate, "equalizer band inactive: {:?}", e
                    );
                }
            }
        }

        let any_active = !sections.is_empty();
        self.control = Some(control.clone());
        self.active = active;

        let wrapped = EqualizedSource {
            inner: source,
            control,
            sections,
            channels,
            sample_rate,
            channel_cursor: 0,
            samples_until_refresh: REFRESH_INTERVAL_SAMPLES,
            seen_generation: 0,
        };
        (wrapped, any_active)
    }

    /// Drop the attachment before the owning stream is destroyed.
    /// Band values persist.
    pub fn detach(&mut self) {
        self.control = None;
        self.active = [false; BAND_COUNT];
    }
}

struct BandSection {
    band_index: usize,
    center_hz: f32,
    q: f32,
    gain_db: f32,
    filters: Vec<DirectForm1<f32>>,
}

/// Wrapper source applying the equalizer sections to every sample
pub struct EqualizedSource<S> {
    inner: S,
    control: Arc<EqControl>,
    sections: Vec<BandSection>,
    channels: usize,
    sample_rate: u32,
    channel_cursor: usize,
    samples_until_refresh: u64,
    seen_generation: u64,
}

impl<S> EqualizedSource<S>
where
    S: Source<Item = f32>,
{
    /// Re-derive coefficients for bands whose gain changed. Runs at block
    /// boundaries on the audio thread; pure arithmetic, no allocation.
    fn refresh_coefficients(&mut self) {
        let generation = self.control.generation.load(Ordering::Acquire);
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;

        for section in &mut self.sections {
            let gain = self.control.gain(section.band_index);
            if gain == section.gain_db {
                continue;
            }
            if let Ok(coeffs) = Coefficients::<f32>::from_params(
                Type::PeakingEQ(gain),
                (self.sample_rate as f32).hz(),
                section.center_hz.hz(),
                section.q,
            ) {
                section.gain_db = gain;
                for filter in &mut section.filters {
                    filter.update_coefficients(coeffs);
                }
            }
        }
    }
}

impl<S> Iterator for EqualizedSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = self.inner.next()?;

        if self.channel_cursor == 0 {
            self.samples_until_refresh = self.samples_until_refresh.saturating_sub(1);
            if self.samples_until_refresh == 0 {
                self.samples_until_refresh = REFRESH_INTERVAL_SAMPLES;
                self.refresh_coefficients();
            }
        }

        let channel = self.channel_cursor;
        self.channel_cursor = (self.channel_cursor + 1) % self.channels;

        let mut out = sample;
        for section in &mut self.sections {
            out = section.filters[channel].run(out);
        }
        Some(out)
    }
}

impl<S> Source for EqualizedSource<S>
where
    S: Source<Item = f32>,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        self.inner.try_seek(pos)?;
        // Discard filter tails from the old position
        for section in &mut self.sections {
            for filter in &mut section.filters {
                filter.reset_state();
            }
        }
        self.channel_cursor = 0;
        Ok(())
    }
}
