//! Shared audio types
//!
//! Pure data types used across the audio subsystem.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::audio::SPECTRUM_BINS;

use super::equalizer::EqBand;

/// Current playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "Stopped"),
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Paused => write!(f, "Paused"),
        }
    }
}

/// Output strategy selected per device.
///
/// Changing mode tears down and reinitializes the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// One stream, the device owns the clock
    #[default]
    Simple,
    /// Engine-owned mixer, the OS pulls fixed-size buffers via callback
    CallbackShared,
    /// Callback mode requesting bounded buffers only; subject to
    /// exclusive-takeover detection
    CallbackExclusive,
}

impl OutputMode {
    /// Whether this mode runs on the callback backend
    pub fn is_callback(self) -> bool {
        !matches!(self, OutputMode::Simple)
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Simple => write!(f, "Simple"),
            OutputMode::CallbackShared => write!(f, "Callback (shared)"),
            OutputMode::CallbackExclusive => write!(f, "Callback (exclusive)"),
        }
    }
}

/// Information about the currently loaded track
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub path: PathBuf,
    pub codec_name: String,
    pub channels: u16,
    pub sample_rate: u32,
    /// Track length in seconds; 0.0 when the container does not report it
    pub duration_secs: f64,
}

impl fmt::Display for TrackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel_str = if self.channels == 1 { "Mono" } else { "Stereo" };
        write!(
            f,
            "{} · {} Hz · {}",
            self.codec_name, self.sample_rate, channel_str
        )
    }
}

/// Commands sent to the engine thread
#[derive(Debug)]
pub enum EngineCommand {
    /// Open a track without starting playback
    Load { path: PathBuf, position: f64 },
    /// Start playback; `path: None` restarts/resumes the current track
    Play {
        path: Option<PathBuf>,
        position: Option<f64>,
    },
    Pause,
    Resume,
    Stop,
    /// Seek to an absolute position in seconds
    Seek(f64),
    /// Set volume (clamped to 0.0..=2.0)
    SetVolume(f32),
    /// Update one equalizer band gain, matched by center frequency
    SetBandGain { center_hz: f32, gain_db: f32 },
    /// Update one equalizer band gain by its position in the band list
    SetBandGainAt { index: usize, gain_db: f32 },
    /// Replace the whole band list (restoring a persisted curve)
    SetBands(Vec<EqBand>),
    /// Tear down and reinitialize the output backend
    SetOutputMode {
        mode: OutputMode,
        device: Option<String>,
    },
    /// Shut down the engine thread
    Shutdown,
}

/// One published half-spectrum frame.
///
/// Replaced wholesale every tick; after bucketing and broadcast it carries
/// only `SPECTRUM_BARS` distinct values across its bins.
#[derive(Clone)]
pub struct SpectrumFrame {
    pub bins: [f32; SPECTRUM_BINS],
}

impl Default for SpectrumFrame {
    fn default() -> Self {
        Self {
            bins: [0.0; SPECTRUM_BINS],
        }
    }
}

impl fmt::Debug for SpectrumFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumFrame")
            .field("bins", &self.bins.len())
            .finish()
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Playback started with track info
    Playing(TrackInfo),
    Paused,
    Resumed,
    /// Playback stopped (user action or genuine end of track);
    /// listeners may auto-advance
    Stopped,
    /// Playback stopped because the output device became unavailable;
    /// listeners must not auto-advance
    DeviceLost,
    /// Current track position in seconds, published on the tick
    PositionChanged(f64),
    /// New spectrum frame, published on the tick
    SpectrumUpdated(Arc<SpectrumFrame>),
    /// An error occurred
    Error(String),
}

/// Shared visualization state, written only by the engine tick
#[derive(Clone)]
pub struct AudioAnalysis {
    pub spectrum: [f32; SPECTRUM_BINS],
    /// Samples pulled through the tap since the stream was attached
    pub sample_count: u64,
}

impl Default for AudioAnalysis {
    fn default() -> Self {
        Self {
            spectrum: [0.0; SPECTRUM_BINS],
            sample_count: 0,
        }
    }
}

impl AudioAnalysis {
    /// Reset all analysis values to zero
    pub fn reset(&mut self) {
        self.spectrum = [0.0; SPECTRUM_BINS];
        self.sample_count = 0;
    }
}

/// Snapshot of engine state, mirrored for synchronous queries
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: PlaybackState,
    pub position_secs: f64,
    pub length_secs: f64,
    pub volume: f32,
    pub device_lost: bool,
    pub output_mode: OutputMode,
    pub device_name: Option<String>,
    pub track: Option<TrackInfo>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: PlaybackState::Stopped,
            position_secs: 0.0,
            length_secs: 0.0,
            volume: 1.0,
            device_lost: false,
            output_mode: OutputMode::Simple,
            device_name: None,
            track: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_state_default_is_stopped() {
        assert_eq!(PlaybackState::default(), PlaybackState::Stopped);
    }

    #[test]
    fn playback_state_display() {
        assert_eq!(PlaybackState::Stopped.to_string(), "Stopped");
        assert_eq!(PlaybackState::Playing.to_string(), "Playing");
        assert_eq!(PlaybackState::Paused.to_string(), "Paused");
    }

    #[test]
    fn output_mode_default_is_simple() {
        assert_eq!(OutputMode::default(), OutputMode::Simple);
        assert!(!OutputMode::Simple.is_callback());
        assert!(OutputMode::CallbackShared.is_callback());
        assert!(OutputMode::CallbackExclusive.is_callback());
    }

    #[test]
    fn track_info_display() {
        let info = TrackInfo {
            path: PathBuf::from("/music/a.flac"),
            codec_name: "FLAC".to_string(),
            channels: 2,
            sample_rate: 48000,
            duration_secs: 183.5,
        };
        assert_eq!(info.to_string(), "FLAC · 48000 Hz · Stereo");

        let mono = TrackInfo {
            channels: 1,
            ..info
        };
        assert!(mono.to_string().contains("Mono"));
    }

    #[test]
    fn spectrum_frame_default_is_zero() {
        let frame = SpectrumFrame::default();
        assert_eq!(frame.bins.len(), SPECTRUM_BINS);
        assert!(frame.bins.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn audio_analysis_reset() {
        let mut analysis = AudioAnalysis {
            spectrum: [0.4; SPECTRUM_BINS],
            sample_count: 99,
        };
        analysis.reset();
        assert!(analysis.spectrum.iter().all(|&v| v == 0.0));
        assert_eq!(analysis.sample_count, 0);
    }

    #[test]
    fn engine_status_default() {
        let status = EngineStatus::default();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.position_secs, 0.0);
        assert_eq!(status.length_secs, 0.0);
        assert_eq!(status.volume, 1.0);
        assert!(!status.device_lost);
        assert!(status.track.is_none());
    }

    #[test]
    fn engine_event_clone_and_debug() {
        let evt = EngineEvent::PositionChanged(1.5);
        let cloned = evt.clone();
        assert!(matches!(cloned, EngineEvent::PositionChanged(p) if p == 1.5));
        let _ = format!("{:?}", EngineEvent::DeviceLost);
        let _ = format!("{:?}", EngineEvent::SpectrumUpdated(Arc::new(SpectrumFrame::default())));
    }
}
