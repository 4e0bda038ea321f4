//! Audio subsystem
//!
//! Playback orchestration, decoding, equalization, output backends, and
//! visualization analysis.
//!

pub mod analyzer;
pub mod backend;
pub mod decoder;
pub mod engine;
pub mod equalizer;
pub mod health;
pub mod math;
pub mod types;

pub use analyzer::{SpectrumAnalyzer, TapHandle, TapSource};
pub use backend::{create_backend, OutputBackend};
pub use decoder::SymphoniaSource;
pub use engine::PlayerEngine;
pub use equalizer::{EqBand, EqualizedSource, Equalizer};
pub use health::{DeviceHealthMonitor, ErrorClass};
pub use types::{
    AudioAnalysis, EngineCommand, EngineEvent, EngineStatus, OutputMode, PlaybackState,
    SpectrumFrame, TrackInfo,
};
