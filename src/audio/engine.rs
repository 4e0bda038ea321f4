//! Player engine
//!
//! Runs playback on a dedicated thread, accepting commands via crossbeam
//! channels and emitting events back. The thread owns the output backend
//! (OS stream handles may be !Send), the equalizer, and the device health
//! monitor; callers interact through the command channel and a small
//! synchronous query surface backed by a status mirror the engine thread
//! keeps current.
//!
//! A 50 ms tick drives position updates, spectrum frames, end-of-track
//! detection, and device-loss detection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::config::audio::FFT_SIZE;
use crate::config::backend::FALLBACK_SAMPLE_RATE;
use crate::config::timing::{COMMAND_QUEUE_LEN, EVENT_QUEUE_LEN, TICK_INTERVAL_MS};
use crate::error::EngineError;

use super::analyzer::{peak_to_db, SpectrumAnalyzer, TapHandle, TapSource};
use super::backend::{create_backend, OutputBackend};
use super::decoder::SymphoniaSource;
use super::equalizer::{EqBand, Equalizer};
use super::health::{DeviceHealthMonitor, ErrorClass};
use super::math::fft_bin_index;
use super::types::{
    AudioAnalysis, EngineCommand, EngineEvent, EngineStatus, OutputMode, PlaybackState,
    SpectrumFrame, TrackInfo,
};

/// Constructs an output backend for a mode and device. Called once at
/// startup and again on every deliberate reinitialization, so device-loss
/// recovery always goes through a fresh backend.
type BackendFactory =
    Box<dyn FnMut(OutputMode, Option<&str>) -> crate::error::Result<Box<dyn OutputBackend>> + Send>;

/// State mirrored for the caller-side query surface
struct SharedQuery {
    status: Mutex<EngineStatus>,
    tap: Mutex<Option<Arc<TapHandle>>>,
    bands: Mutex<Vec<EqBand>>,
}

/// Player engine that manages playback on a dedicated thread
pub struct PlayerEngine {
    cmd_tx: Sender<EngineCommand>,
    event_rx: Receiver<EngineEvent>,
    analysis: Arc<Mutex<AudioAnalysis>>,
    shared: Arc<SharedQuery>,
    thread: Option<JoinHandle<()>>,
}

impl PlayerEngine {
    /// Create a new engine with the default (simple) backend on the
    /// default device.
    ///
    /// Blocks until the output backend is initialized (or fails).
    pub fn new() -> Result<Self, EngineError> {
        Self::with_output(OutputMode::Simple, None)
    }

    /// Create an engine with an explicit output mode and device
    pub fn with_output(
        mode: OutputMode,
        device: Option<String>,
    ) -> Result<Self, EngineError> {
        Self::with_factory(mode, device, Box::new(create_backend))
    }

    /// Backend construction is injected here so tests can drive the engine
    /// without audio hardware
    fn with_factory(
        mode: OutputMode,
        device: Option<String>,
        factory: BackendFactory,
    ) -> Result<Self, EngineError> {
        let (cmd_tx, cmd_rx) = bounded::<EngineCommand>(COMMAND_QUEUE_LEN);
        let (event_tx, event_rx) = bounded::<EngineEvent>(EVENT_QUEUE_LEN);
        let (init_tx, init_rx) = bounded::<Result<(), String>>(1);

        let analysis = Arc::new(Mutex::new(AudioAnalysis::default()));
        let shared = Arc::new(SharedQuery {
            status: Mutex::new(EngineStatus {
                output_mode: mode,
                device_name: device.clone(),
                ..EngineStatus::default()
            }),
            tap: Mutex::new(None),
            bands: Mutex::new(Vec::new()),
        });

        let analysis_thread = analysis.clone();
        let shared_thread = shared.clone();

        let thread = thread::Builder::new()
            .name("player-engine".to_string())
            .spawn(move || {
                Runner::run(
                    cmd_rx,
                    event_tx,
                    init_tx,
                    analysis_thread,
                    shared_thread,
                    mode,
                    device,
                    factory,
                );
            })
            .map_err(|e| EngineError::Audio(format!("failed to spawn engine thread: {e}")))?;

        let init_result = init_rx
            .recv()
            .map_err(|_| EngineError::Audio("engine thread terminated during init".into()))?;
        init_result.map_err(EngineError::DeviceUnavailable)?;

        Ok(Self {
            cmd_tx,
            event_rx,
            analysis,
            shared,
            thread: Some(thread),
        })
    }

    /// Send a command to the engine
    pub fn send(&self, cmd: EngineCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Open a track without starting playback
    pub fn load<P: Into<PathBuf>>(&self, path: P) {
        self.send(EngineCommand::Load {
            path: path.into(),
            position: 0.0,
        });
    }

    /// Open a track at an offset without starting playback
    pub fn load_at<P: Into<PathBuf>>(&self, path: P, position: f64) {
        self.send(EngineCommand::Load {
            path: path.into(),
            position,
        });
    }

    /// Start playing the given track from the beginning
    pub fn play<P: Into<PathBuf>>(&self, path: P) {
        self.send(EngineCommand::Play {
            path: Some(path.into()),
            position: None,
        });
    }

    /// Start playing the given track at an offset
    pub fn play_at<P: Into<PathBuf>>(&self, path: P, position: f64) {
        self.send(EngineCommand::Play {
            path: Some(path.into()),
            position: Some(position),
        });
    }

    /// Restart or resume the current track
    pub fn play_current(&self) {
        self.send(EngineCommand::Play {
            path: None,
            position: None,
        });
    }

    pub fn pause(&self) {
        self.send(EngineCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(EngineCommand::Resume);
    }

    pub fn stop(&self) {
        self.send(EngineCommand::Stop);
    }

    /// Seek to an absolute position in seconds
    pub fn seek(&self, position: f64) {
        self.send(EngineCommand::Seek(position));
    }

    /// Set volume (clamped to 0.0..=2.0)
    pub fn set_volume(&self, volume: f32) {
        self.send(EngineCommand::SetVolume(volume));
    }

    /// Update one equalizer band gain, matched by center frequency
    pub fn set_band_gain(&self, center_hz: f32, gain_db: f32) {
        self.send(EngineCommand::SetBandGain { center_hz, gain_db });
    }

    /// Update one equalizer band gain by its position in the band list
    pub fn set_band_gain_at(&self, index: usize, gain_db: f32) {
        self.send(EngineCommand::SetBandGainAt { index, gain_db });
    }

    /// Replace the whole equalizer band list
    pub fn set_bands(&self, bands: Vec<EqBand>) {
        self.send(EngineCommand::SetBands(bands));
    }

    /// Tear down and reinitialize the output backend
    pub fn set_output_mode(&self, mode: OutputMode, device: Option<String>) {
        self.send(EngineCommand::SetOutputMode { mode, device });
    }

    // --- Query surface ---

    fn status(&self) -> EngineStatus {
        self.shared
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_playing(&self) -> bool {
        self.status().state == PlaybackState::Playing
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.status().state
    }

    /// Current track position in seconds
    pub fn position(&self) -> f64 {
        self.status().position_secs
    }

    /// Current track length in seconds; 0.0 when unknown
    pub fn track_length(&self) -> f64 {
        self.status().length_secs
    }

    pub fn is_device_lost(&self) -> bool {
        self.status().device_lost
    }

    pub fn volume(&self) -> f32 {
        self.status().volume
    }

    pub fn output_mode(&self) -> OutputMode {
        self.status().output_mode
    }

    /// Name of the configured output device; None means the host default
    pub fn output_device(&self) -> Option<String> {
        self.status().device_name
    }

    pub fn current_track(&self) -> Option<TrackInfo> {
        self.status().track
    }

    /// Combined peak level in dB full scale. NaN means "no data" (device
    /// lost or nothing attached), which is distinct from silence (−120 dB).
    pub fn decibel_level(&self) -> f32 {
        match self.read_levels() {
            Some((left, right)) => peak_to_db(left.max(right)),
            None => f32::NAN,
        }
    }

    /// Per-channel peak levels in dB full scale; NaN pair on no data
    pub fn stereo_levels(&self) -> (f32, f32) {
        match self.read_levels() {
            Some((left, right)) => (peak_to_db(left), peak_to_db(right)),
            None => (f32::NAN, f32::NAN),
        }
    }

    fn read_levels(&self) -> Option<(u16, u16)> {
        if self.status().device_lost {
            return None;
        }
        let tap = self.shared.tap.lock().ok()?;
        tap.as_ref().map(|t| t.peak_levels())
    }

    /// Map a frequency to its bin in the published spectrum, using the
    /// current track's sample rate
    pub fn frequency_to_bin_index(&self, frequency_hz: f32) -> usize {
        let rate = self
            .current_track()
            .map(|t| t.sample_rate)
            .unwrap_or(FALLBACK_SAMPLE_RATE);
        fft_bin_index(rate as f32, frequency_hz, FFT_SIZE)
    }

    /// Size of the transform behind every published spectrum frame
    pub fn expected_transform_size(&self) -> usize {
        FFT_SIZE
    }

    /// The current equalizer band values
    pub fn bands(&self) -> Vec<EqBand> {
        self.shared
            .bands
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Non-blocking poll for the next event
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    /// The event receiver, for use with `select!`
    pub fn event_receiver(&self) -> &Receiver<EngineEvent> {
        &self.event_rx
    }

    /// Handle to the shared visualization state
    pub fn analysis(&self) -> Arc<Mutex<AudioAnalysis>> {
        self.analysis.clone()
    }

    /// Graceful shutdown (consumes self)
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlayerEngine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Resources tied to one open stream
struct CurrentStream {
    tap: Arc<TapHandle>,
    position_ms: Arc<AtomicU64>,
    error_slot: Arc<Mutex<Option<String>>>,
    info: TrackInfo,
}

/// Engine-thread state and behavior
struct Runner {
    backend: Box<dyn OutputBackend>,
    factory: BackendFactory,
    event_tx: Sender<EngineEvent>,
    analysis: Arc<Mutex<AudioAnalysis>>,
    shared: Arc<SharedQuery>,
    state: PlaybackState,
    volume: f32,
    health: DeviceHealthMonitor,
    equalizer: Equalizer,
    analyzer: SpectrumAnalyzer,
    output_mode: OutputMode,
    device_name: Option<String>,
    current: Option<CurrentStream>,
    position_secs: f64,
    length_secs: f64,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    fn run(
        cmd_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        init_tx: Sender<Result<(), String>>,
        analysis: Arc<Mutex<AudioAnalysis>>,
        shared: Arc<SharedQuery>,
        mode: OutputMode,
        device: Option<String>,
        mut factory: BackendFactory,
    ) {
        // Create the backend on this thread; OS stream handles stay here
        let backend = match factory(mode, device.as_deref()) {
            Ok(b) => b,
            Err(e) => {
                let _ = init_tx.send(Err(e.to_string()));
                return;
            }
        };
        let _ = init_tx.send(Ok(()));

        let mut runner = Runner {
            backend,
            factory,
            event_tx,
            analysis,
            shared,
            state: PlaybackState::Stopped,
            volume: 1.0,
            health: DeviceHealthMonitor::new(),
            equalizer: Equalizer::new(),
            analyzer: SpectrumAnalyzer::new(),
            output_mode: mode,
            device_name: device,
            current: None,
            position_secs: 0.0,
            length_secs: 0.0,
        };
        runner.publish_bands();
        runner.publish_status();

        loop {
            match cmd_rx.recv_timeout(Duration::from_millis(TICK_INTERVAL_MS)) {
                Ok(EngineCommand::Shutdown) => {
                    runner.teardown();
                    break;
                }
                Ok(cmd) => {
                    runner.handle_command(cmd);
                    runner.publish_status();
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    runner.tick();
                    runner.publish_status();
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    runner.teardown();
                    break;
                }
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_status(&self) {
        if let Ok(mut status) = self.shared.status.lock() {
            status.state = self.state;
            status.position_secs = self.position_secs;
            status.length_secs = self.length_secs;
            status.volume = self.volume;
            status.device_lost = self.health.is_lost();
            status.output_mode = self.output_mode;
            status.device_name = self.device_name.clone();
            status.track = self.current.as_ref().map(|c| c.info.clone());
        }
    }

    fn publish_bands(&self) {
        if let Ok(mut bands) = self.shared.bands.lock() {
            *bands = self.equalizer.bands().to_vec();
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Load { path, position } => {
                // Loading alone never starts playback
                self.teardown();
                self.state = PlaybackState::Stopped;
                if self.load_stream(&path, position) {
                    info!(path = %path.display(), "track loaded");
                }
            }
            EngineCommand::Play { path, position } => self.handle_play(path, position),
            EngineCommand::Pause => {
                if self.state == PlaybackState::Playing {
                    self.backend.pause();
                    self.state = PlaybackState::Paused;
                    self.emit(EngineEvent::Paused);
                }
            }
            EngineCommand::Resume => {
                if self.state == PlaybackState::Paused {
                    if self.backend.resume() {
                        self.state = PlaybackState::Playing;
                        self.emit(EngineEvent::Resumed);
                    } else {
                        self.record_backend_error();
                    }
                }
            }
            EngineCommand::Stop => {
                self.teardown();
                self.state = PlaybackState::Stopped;
                self.position_secs = 0.0;
                // Stop always notifies, even when already stopped, so
                // listeners never miss a terminal transition
                self.emit(EngineEvent::Stopped);
            }
            EngineCommand::Seek(position) => self.handle_seek(position),
            EngineCommand::SetVolume(volume) => {
                self.volume = volume.clamp(0.0, 2.0);
                self.backend.set_volume(self.volume);
            }
            EngineCommand::SetBandGain { center_hz, gain_db } => {
                self.equalizer.set_band_gain(center_hz, gain_db);
                self.publish_bands();
            }
            EngineCommand::SetBandGainAt { index, gain_db } => {
                self.equalizer.set_band_gain_at(index, gain_db);
                self.publish_bands();
            }
            EngineCommand::SetBands(bands) => {
                self.equalizer.set_bands(&bands);
                self.publish_bands();
            }
            EngineCommand::SetOutputMode { mode, device } => {
                self.handle_set_output_mode(mode, device);
            }
            EngineCommand::Shutdown => unreachable!("handled in the loop"),
        }
    }

    /// Tear down the current stream without emitting any event.
    /// Play/Load replacement goes through here; the public Stop adds its
    /// own notification on top.
    fn teardown(&mut self) {
        self.backend.stop();
        self.equalizer.detach();
        self.current = None;
        self.length_secs = 0.0;
        if let Ok(mut tap) = self.shared.tap.lock() {
            *tap = None;
        }
        if let Ok(mut data) = self.analysis.lock() {
            data.reset();
        }
    }

    /// Open a track and attach the full decode chain to the backend.
    /// Leaves playback paused; the caller decides whether to start.
    fn load_stream(&mut self, path: &Path, position: f64) -> bool {
        let source = match SymphoniaSource::from_path(path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), "cannot open track: {e}");
                self.emit(EngineEvent::Error(format!("cannot open track: {e}")));
                return false;
            }
        };

        let info = source.track_info(path);
        let length = source.duration_secs();
        let position_ms = source.position_clock();
        let error_slot = source.error_slot();

        let tap_handle = Arc::new(TapHandle::new());
        let tapped = TapSource::new(source, tap_handle.clone());
        let (equalized, eq_ok) = self.equalizer.attach(tapped);
        if !eq_ok {
            debug!("no equalizer band active for this stream");
        }

        if !self.backend.attach(Box::new(equalized)) {
            self.record_backend_error();
            self.equalizer.detach();
            self.emit(EngineEvent::Error("cannot attach output stream".into()));
            return false;
        }
        self.backend.set_volume(self.volume);

        if position > 0.0 && !self.backend.seek(position) {
            debug!(position, "initial seek rejected by backend");
        }

        if let Ok(mut tap) = self.shared.tap.lock() {
            *tap = Some(tap_handle.clone());
        }
        self.current = Some(CurrentStream {
            tap: tap_handle,
            position_ms,
            error_slot,
            info,
        });
        self.length_secs = length;
        self.position_secs = position.max(0.0);
        true
    }

    fn handle_play(&mut self, path: Option<PathBuf>, position: Option<f64>) {
        // Play on a paused stream is a resume, not a reload
        if self.state == PlaybackState::Paused && self.current.is_some() {
            if self.backend.resume() {
                self.state = PlaybackState::Playing;
                self.emit(EngineEvent::Resumed);
            } else {
                self.record_backend_error();
            }
            return;
        }

        let target = match path.or_else(|| self.current.as_ref().map(|c| c.info.path.clone())) {
            Some(p) => p,
            None => {
                self.emit(EngineEvent::Error("no track to play".into()));
                return;
            }
        };

        self.teardown();
        self.state = PlaybackState::Stopped;

        // A lost device requires a deliberate reinitialization, the only
        // path that clears the sticky flag
        if self.health.is_lost() {
            info!("device was lost; reinitializing output backend");
            let device = self.device_name.clone();
            match (self.factory)(self.output_mode, device.as_deref()) {
                Ok(backend) => {
                    self.backend = backend;
                    self.health.reset();
                }
                Err(e) => {
                    warn!("backend reinitialization failed: {e}");
                    self.emit(EngineEvent::Error(e.to_string()));
                    return;
                }
            }
        }

        if !self.load_stream(&target, position.unwrap_or(0.0)) {
            return;
        }

        if self.backend.start() {
            self.state = PlaybackState::Playing;
            self.health.record_success();
            if let Some(info) = self.current.as_ref().map(|c| c.info.clone()) {
                info!(track = %info, "playback started");
                self.emit(EngineEvent::Playing(info));
            }
        } else {
            self.record_backend_error();
            self.teardown();
            self.emit(EngineEvent::Error("cannot start playback".into()));
        }
    }

    fn handle_seek(&mut self, position: f64) {
        if self.current.is_none() {
            return;
        }
        if !position.is_finite()
            || position < 0.0
            || (self.length_secs > 0.0 && position > self.length_secs)
        {
            debug!(position, length = self.length_secs, "seek out of bounds");
            return;
        }

        let was_playing = self.state == PlaybackState::Playing;
        if was_playing {
            self.backend.pause();
        }
        if self.backend.seek(position) {
            self.position_secs = position;
        }
        if was_playing && !self.backend.resume() {
            self.record_backend_error();
        }
    }

    fn handle_set_output_mode(&mut self, mode: OutputMode, device: Option<String>) {
        // Build the replacement first so a failure keeps the old backend
        match (self.factory)(mode, device.as_deref()) {
            Ok(backend) => {
                let was_active = self.state != PlaybackState::Stopped;
                self.teardown();
                self.state = PlaybackState::Stopped;
                self.position_secs = 0.0;
                if was_active {
                    self.emit(EngineEvent::Stopped);
                }
                self.backend = backend;
                self.backend.set_volume(self.volume);
                self.output_mode = mode;
                self.device_name = device;
                self.health.reset();
                info!(%mode, "output backend reinitialized");
            }
            Err(e) => {
                warn!("cannot switch output mode: {e}");
                self.emit(EngineEvent::Error(e.to_string()));
            }
        }
    }

    fn record_backend_error(&mut self) {
        let class = self.backend.take_error().unwrap_or(ErrorClass::Other);
        self.health.record_error(class);
    }

    /// Involuntary stop: the device went away underneath us. Emits a
    /// notification distinct from the normal end-of-track so listeners do
    /// not auto-advance.
    fn device_lost_stop(&mut self) {
        error!("output device lost; stopping playback");
        self.teardown();
        self.state = PlaybackState::Stopped;
        self.position_secs = 0.0;
        self.emit(EngineEvent::DeviceLost);
    }

    fn tick(&mut self) {
        // Backend-thread errors surface here
        let backend_error = self.backend.take_error();
        if let Some(class) = backend_error {
            self.health.record_error(class);
        }

        if self.health.is_lost() {
            if self.state != PlaybackState::Stopped {
                self.device_lost_stop();
            }
            return;
        }

        // Silent takeover: the host stream died but no command was issued
        if self.backend.host_stream_stopped() && self.state != PlaybackState::Stopped {
            self.health.record_error(ErrorClass::Busy);
            self.device_lost_stop();
            return;
        }

        if self.state != PlaybackState::Playing {
            return;
        }
        let Some(ref current) = self.current else {
            return;
        };

        // End of track: the decode chain is exhausted and, on the simple
        // backend, the sink has drained what it buffered
        let ended = if self.backend.mode().is_callback() {
            current.tap.is_finished()
        } else {
            self.backend.is_idle()
        };
        if ended {
            if let Ok(guard) = current.error_slot.lock() {
                if let Some(ref msg) = *guard {
                    warn!("stream ended with decode error: {msg}");
                    self.emit(EngineEvent::Error(format!("stream error: {msg}")));
                }
            }
            self.teardown();
            self.state = PlaybackState::Stopped;
            self.position_secs = 0.0;
            // Genuine completion; listeners may advance
            self.emit(EngineEvent::Stopped);
            return;
        }

        // Position, from the decoder's packet clock
        let millis = current.position_ms.load(Ordering::Relaxed);
        self.position_secs = millis as f64 / 1000.0;
        self.emit(EngineEvent::PositionChanged(self.position_secs));

        // Spectrum: a missing window degrades to an all-zero frame rather
        // than an error
        let frame = match current.tap.latest_window() {
            Some(window) => self.analyzer.analyze(&window),
            None => SpectrumFrame::default(),
        };
        if let Ok(mut data) = self.analysis.lock() {
            data.spectrum = frame.bins;
            data.sample_count = current.tap.sample_count();
        }
        self.emit(EngineEvent::SpectrumUpdated(Arc::new(frame)));
        // A tick that drained an error is not a successful read; letting it
        // reset the counter would keep repeated transient errors from ever
        // reaching the threshold
        if backend_error.is_none() {
            self.health.record_success();
        }
    }
}
