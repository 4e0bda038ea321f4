//! Tonearm audio player engine
//!
//! Real-time playback with spectrum visualization and a parametric
//! equalizer, behind one playback state machine.
//!
//! ## Quick start
//!
//! ```no_run
//! use tonearm::audio::PlayerEngine;
//!
//! let engine = PlayerEngine::new().expect("audio output");
//! engine.play("/music/track.flac");
//! ```

pub mod audio;
pub mod config;
pub mod error;
