//! Output backends
//!
//! Two interchangeable output strategies behind one contract. The simple
//! backend hands the decode chain to a device-clocked sink and lets the
//! device drive playback. The callback backend owns a mixer slot and feeds
//! the OS directly: the host pulls fixed-size buffers on its own thread,
//! and the callback copies samples without blocking or allocating.
//!
//! Backends are created, used, and dropped on the engine thread; the OS
//! stream handle never crosses threads.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tracing::{debug, warn};

use crate::config::backend::CALLBACK_BUFFER_FRAMES;
use crate::error::{EngineError, Result};

use super::health::ErrorClass;
use super::types::OutputMode;

/// The fully wrapped decode chain handed to a backend
pub type BoxedSource = Box<dyn Source<Item = f32> + Send>;

/// Contract shared by both output strategies.
///
/// Operations that can fail return a boolean and record the error class;
/// the state machine decides whether a failure marks the device lost.
pub trait OutputBackend {
    /// Hand a new decode chain to the backend, replacing any current one.
    /// Playback does not start until [`start`](Self::start).
    fn attach(&mut self, source: BoxedSource) -> bool;

    /// Begin or restart playback of the attached chain
    fn start(&mut self) -> bool;

    fn pause(&mut self);

    fn resume(&mut self) -> bool;

    /// Reposition the attached chain to an absolute offset in seconds
    fn seek(&mut self, position_secs: f64) -> bool;

    /// Stop playback and discard the attached chain
    fn stop(&mut self);

    fn set_volume(&mut self, volume: f32);

    /// Whether the backend has nothing left to play
    fn is_idle(&self) -> bool;

    fn mode(&self) -> OutputMode;

    /// Whether the host-side stream died underneath us (callback backends
    /// only; detects silent takeover by another exclusive consumer)
    fn host_stream_stopped(&self) -> bool;

    /// Consume the most recent error classification, if any
    fn take_error(&mut self) -> Option<ErrorClass>;
}

/// Locate an output device by name, or the host default
fn find_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceUnavailable("no default output device".into())),
        Some(wanted) => {
            let mut devices = host
                .output_devices()
                .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    EngineError::DeviceUnavailable(format!("output device not found: {wanted}"))
                })
        }
    }
}

/// Construct the backend for the requested mode
pub fn create_backend(mode: OutputMode, device: Option<&str>) -> Result<Box<dyn OutputBackend>> {
    match mode {
        OutputMode::Simple => Ok(Box::new(SimpleBackend::init(device)?)),
        callback => Ok(Box::new(CallbackBackend::init(device, callback)?)),
    }
}

fn classify_build_error(err: &cpal::BuildStreamError) -> ErrorClass {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => ErrorClass::Busy,
        cpal::BuildStreamError::StreamConfigNotSupported => ErrorClass::Other,
        _ => ErrorClass::Transient,
    }
}

fn classify_play_error(err: &cpal::PlayStreamError) -> ErrorClass {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => ErrorClass::Busy,
        _ => ErrorClass::Transient,
    }
}

// ---------------------------------------------------------------------------
// Simple backend
// ---------------------------------------------------------------------------

/// One stream against the chosen device; the device owns the clock
pub struct SimpleBackend {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    volume: f32,
    last_error: Option<ErrorClass>,
}

impl SimpleBackend {
    pub fn init(device_name: Option<&str>) -> Result<Self> {
        let (stream, handle) = match device_name {
            Some(name) => {
                let device = find_device(Some(name))?;
                OutputStream::try_from_device(&device)
            }
            None => OutputStream::try_default(),
        }
        .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            handle,
            sink: None,
            volume: 1.0,
            last_error: None,
        })
    }
}

impl OutputBackend for SimpleBackend {
    fn attach(&mut self, source: BoxedSource) -> bool {
        self.sink = None;
        let sink = match Sink::try_new(&self.handle) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("cannot open playback sink: {e}");
                self.last_error = Some(ErrorClass::Other);
                return false;
            }
        };
        sink.pause();
        sink.set_volume(self.volume);
        sink.append(source);
        self.sink = Some(sink);
        true
    }

    fn start(&mut self) -> bool {
        match self.sink {
            Some(ref sink) => {
                sink.play();
                true
            }
            None => false,
        }
    }

    fn pause(&mut self) {
        if let Some(ref sink) = self.sink {
            sink.pause();
        }
    }

    fn resume(&mut self) -> bool {
        match self.sink {
            Some(ref sink) => {
                sink.play();
                true
            }
            None => false,
        }
    }

    fn seek(&mut self, position_secs: f64) -> bool {
        let Some(ref sink) = self.sink else {
            return false;
        };
        match sink.try_seek(Duration::from_secs_f64(position_secs)) {
            Ok(()) => true,
            Err(e) => {
                warn!("seek failed: {e}");
                self.last_error = Some(ErrorClass::Other);
                false
            }
        }
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(ref sink) = self.sink {
            sink.set_volume(volume);
        }
    }

    fn is_idle(&self) -> bool {
        self.sink.as_ref().map(|s| s.empty()).unwrap_or(true)
    }

    fn mode(&self) -> OutputMode {
        OutputMode::Simple
    }

    fn host_stream_stopped(&self) -> bool {
        false
    }

    fn take_error(&mut self) -> Option<ErrorClass> {
        self.last_error.take()
    }
}

// ---------------------------------------------------------------------------
// Callback backend
// ---------------------------------------------------------------------------

const ERR_NONE: u8 = 0;
const ERR_BUSY: u8 = 1;
const ERR_TRANSIENT: u8 = 2;

/// State shared with the host callback thread.
///
/// The callback only ever `try_lock`s the slot; a held lock means one
/// buffer of silence, never a block on the audio thread.
struct MixerShared {
    slot: Mutex<Option<BoxedSource>>,
    playing: AtomicBool,
    volume_bits: AtomicU32,
    stream_dead: AtomicBool,
    error_class: AtomicU8,
}

impl MixerShared {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            playing: AtomicBool::new(false),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            stream_dead: AtomicBool::new(false),
            error_class: AtomicU8::new(ERR_NONE),
        }
    }
}

/// Fill one host buffer. Pulls from the mixer slot, applies volume, and
/// zero-fills any shortfall so the host always receives the full requested
/// length.
fn fill_f32(data: &mut [f32], shared: &MixerShared) {
    if !shared.playing.load(Ordering::Relaxed) {
        data.fill(0.0);
        return;
    }
    let Ok(mut slot) = shared.slot.try_lock() else {
        data.fill(0.0);
        return;
    };
    let Some(source) = slot.as_mut() else {
        data.fill(0.0);
        return;
    };
    let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));
    let mut filled = 0;
    for out in data.iter_mut() {
        match source.next() {
            Some(sample) => {
                *out = sample * volume;
                filled += 1;
            }
            None => break,
        }
    }
    data[filled..].fill(0.0);
}

fn fill_i16(data: &mut [i16], shared: &MixerShared) {
    if !shared.playing.load(Ordering::Relaxed) {
        data.fill(0);
        return;
    }
    let Ok(mut slot) = shared.slot.try_lock() else {
        data.fill(0);
        return;
    };
    let Some(source) = slot.as_mut() else {
        data.fill(0);
        return;
    };
    let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));
    let mut filled = 0;
    for out in data.iter_mut() {
        match source.next() {
            Some(sample) => {
                *out = ((sample * volume).clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                filled += 1;
            }
            None => break,
        }
    }
    data[filled..].fill(0);
}

/// Engine-owned mixer; the OS pulls fixed-size buffers via callback
pub struct CallbackBackend {
    device: cpal::Device,
    stream: Option<cpal::Stream>,
    shared: Arc<MixerShared>,
    mode: OutputMode,
    last_error: Option<ErrorClass>,
}

impl CallbackBackend {
    pub fn init(device_name: Option<&str>, mode: OutputMode) -> Result<Self> {
        let device = find_device(device_name)?;
        // Probe for output support up front so mode selection fails loudly
        device
            .default_output_config()
            .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            device,
            stream: None,
            shared: Arc::new(MixerShared::new()),
            mode,
            last_error: None,
        })
    }

    /// Build the host stream for one format and buffer configuration
    fn build_stream(
        &self,
        format: SampleFormat,
        config: &StreamConfig,
    ) -> std::result::Result<cpal::Stream, cpal::BuildStreamError> {
        let err_shared = Arc::clone(&self.shared);
        let err_fn = move |err: cpal::StreamError| {
            warn!("output stream error: {err}");
            let class = match err {
                cpal::StreamError::DeviceNotAvailable => ERR_BUSY,
                _ => ERR_TRANSIENT,
            };
            err_shared.error_class.store(class, Ordering::Release);
            err_shared.stream_dead.store(true, Ordering::Release);
        };

        match format {
            SampleFormat::F32 => {
                let shared = Arc::clone(&self.shared);
                self.device.build_output_stream(
                    config,
                    move |data: &mut [f32], _| fill_f32(data, &shared),
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let shared = Arc::clone(&self.shared);
                self.device.build_output_stream(
                    config,
                    move |data: &mut [i16], _| fill_i16(data, &shared),
                    err_fn,
                    None,
                )
            }
            _ => Err(cpal::BuildStreamError::StreamConfigNotSupported),
        }
    }

    /// Try stream configurations in fallback order; first success wins.
    ///
    /// Exclusive mode only accepts the bounded-latency steps: falling back
    /// to host-chosen buffering would defeat the point of requesting it.
    fn open_stream(&mut self, channels: u16, sample_rate: u32) -> bool {
        let bounded = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Fixed(CALLBACK_BUFFER_FRAMES),
        };
        let unbounded = StreamConfig {
            buffer_size: BufferSize::Default,
            ..bounded
        };

        let attempts: Vec<(SampleFormat, StreamConfig)> =
            if self.mode == OutputMode::CallbackExclusive {
                vec![
                    (SampleFormat::F32, bounded.clone()),
                    (SampleFormat::I16, bounded),
                ]
            } else {
                vec![
                    (SampleFormat::F32, bounded.clone()),
                    (SampleFormat::F32, unbounded.clone()),
                    (SampleFormat::I16, bounded),
                    (SampleFormat::I16, unbounded),
                ]
            };

        let mut last_class = ErrorClass::Other;
        for (format, config) in attempts {
            match self.build_stream(format, &config) {
                Ok(stream) => {
                    debug!(?format, ?config.buffer_size, "output stream opened");
                    self.stream = Some(stream);
                    self.shared.stream_dead.store(false, Ordering::Release);
                    self.shared.error_class.store(ERR_NONE, Ordering::Release);
                    return true;
                }
                Err(e) => {
                    debug!(?format, ?config.buffer_size, "stream config rejected: {e}");
                    last_class = classify_build_error(&e);
                }
            }
        }
        warn!("all output stream configurations rejected");
        self.last_error = Some(last_class);
        false
    }
}

impl OutputBackend for CallbackBackend {
    fn attach(&mut self, source: BoxedSource) -> bool {
        self.stream = None;
        self.shared.playing.store(false, Ordering::Release);

        let channels = source.channels();
        let sample_rate = source.sample_rate();
        if let Ok(mut slot) = self.shared.slot.lock() {
            *slot = Some(source);
        } else {
            return false;
        }
        self.open_stream(channels, sample_rate)
    }

    fn start(&mut self) -> bool {
        let Some(ref stream) = self.stream else {
            return false;
        };
        match stream.play() {
            Ok(()) => {
                self.shared.playing.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                warn!("cannot start output stream: {e}");
                self.last_error = Some(classify_play_error(&e));
                false
            }
        }
    }

    fn pause(&mut self) {
        // The stream keeps pulling; the callback delivers silence
        self.shared.playing.store(false, Ordering::Release);
    }

    fn resume(&mut self) -> bool {
        if self.stream.is_none() || self.shared.stream_dead.load(Ordering::Acquire) {
            return false;
        }
        self.shared.playing.store(true, Ordering::Release);
        true
    }

    fn seek(&mut self, position_secs: f64) -> bool {
        let Ok(mut slot) = self.shared.slot.lock() else {
            return false;
        };
        let Some(source) = slot.as_mut() else {
            return false;
        };
        match source.try_seek(Duration::from_secs_f64(position_secs)) {
            Ok(()) => true,
            Err(e) => {
                warn!("seek failed: {e}");
                self.last_error = Some(ErrorClass::Other);
                false
            }
        }
    }

    fn stop(&mut self) {
        self.shared.playing.store(false, Ordering::Release);
        if let Ok(mut slot) = self.shared.slot.lock() {
            *slot = None;
        }
        self.stream = None;
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared
            .volume_bits
            .store(volume.to_bits(), Ordering::Relaxed);
    }

    fn is_idle(&self) -> bool {
        match self.shared.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(_) => true,
        }
    }

    fn mode(&self) -> OutputMode {
        self.mode
    }

    fn host_stream_stopped(&self) -> bool {
        self.stream.is_some() && self.shared.stream_dead.load(Ordering::Acquire)
    }

    fn take_error(&mut self) -> Option<ErrorClass> {
        if let Some(class) = self.last_error.take() {
            return Some(class);
        }
        match self.shared.error_class.swap(ERR_NONE, Ordering::AcqRel) {
            ERR_BUSY => Some(ErrorClass::Busy),
            ERR_TRANSIENT => Some(ErrorClass::Transient),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rodio::buffer::SamplesBuffer;

    fn boxed(channels: u16, rate: u32, data: Vec<f32>) -> BoxedSource {
        Box::new(SamplesBuffer::new(channels, rate, data))
    }

    // --- Error classification ---

    #[test]
    fn device_not_available_is_busy() {
        assert_eq!(
            classify_build_error(&cpal::BuildStreamError::DeviceNotAvailable),
            ErrorClass::Busy
        );
        assert_eq!(
            classify_play_error(&cpal::PlayStreamError::DeviceNotAvailable),
            ErrorClass::Busy
        );
    }

    #[test]
    fn unsupported_config_is_other() {
        assert_eq!(
            classify_build_error(&cpal::BuildStreamError::StreamConfigNotSupported),
            ErrorClass::Other
        );
    }

    // --- Callback fill, no hardware needed ---

    #[test]
    fn fill_silence_when_not_playing() {
        let shared = MixerShared::new();
        *shared.slot.lock().unwrap() = Some(boxed(1, 44100, vec![0.5; 64]));
        let mut data = [1.0f32; 32];
        fill_f32(&mut data, &shared);
        assert!(data.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn fill_silence_when_slot_empty() {
        let shared = MixerShared::new();
        shared.playing.store(true, Ordering::Release);
        let mut data = [1.0f32; 32];
        fill_f32(&mut data, &shared);
        assert!(data.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn fill_copies_samples_with_volume() {
        let shared = MixerShared::new();
        shared.playing.store(true, Ordering::Release);
        shared.volume_bits.store(0.5f32.to_bits(), Ordering::Relaxed);
        *shared.slot.lock().unwrap() = Some(boxed(1, 44100, vec![0.8; 32]));
        let mut data = [0.0f32; 32];
        fill_f32(&mut data, &shared);
        for &s in &data {
            assert!((s - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn fill_zero_fills_shortfall() {
        // Source runs out mid-buffer; the tail must be silence, and the
        // full requested length is always written
        let shared = MixerShared::new();
        shared.playing.store(true, Ordering::Release);
        *shared.slot.lock().unwrap() = Some(boxed(1, 44100, vec![0.5; 10]));
        let mut data = [9.0f32; 32];
        fill_f32(&mut data, &shared);
        assert!(data[..10].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(data[10..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn fill_silence_under_lock_contention() {
        let shared = MixerShared::new();
        shared.playing.store(true, Ordering::Release);
        *shared.slot.lock().unwrap() = Some(boxed(1, 44100, vec![0.5; 64]));

        let _held = shared.slot.lock().unwrap();
        let mut data = [1.0f32; 16];
        fill_f32(&mut data, &shared);
        assert!(data.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn fill_i16_converts_full_scale() {
        let shared = MixerShared::new();
        shared.playing.store(true, Ordering::Release);
        *shared.slot.lock().unwrap() = Some(boxed(1, 44100, vec![1.0, -1.0, 0.0, 2.0]));
        let mut data = [0i16; 4];
        fill_i16(&mut data, &shared);
        assert_eq!(data[0], i16::MAX);
        assert_eq!(data[1], -i16::MAX);
        assert_eq!(data[2], 0);
        // Over-range input is clamped, not wrapped
        assert_eq!(data[3], i16::MAX);
    }

    #[test]
    fn fill_i16_silence_when_not_playing() {
        let shared = MixerShared::new();
        *shared.slot.lock().unwrap() = Some(boxed(1, 44100, vec![0.5; 16]));
        let mut data = [7i16; 16];
        fill_i16(&mut data, &shared);
        assert!(data.iter().all(|&s| s == 0));
    }

    // --- Hardware-gated backend tests ---
    // These run only where an output device exists; absence is a skip,
    // not a failure.

    fn try_simple() -> Option<SimpleBackend> {
        SimpleBackend::init(None).ok()
    }

    fn try_callback(mode: OutputMode) -> Option<CallbackBackend> {
        CallbackBackend::init(None, mode).ok()
    }

    #[test]
    fn simple_backend_lifecycle() {
        let Some(mut backend) = try_simple() else {
            eprintln!("no output device; skipping");
            return;
        };
        assert!(backend.is_idle());
        assert!(!backend.start(), "start without attach must fail");

        assert!(backend.attach(boxed(2, 44100, vec![0.0; 4410])));
        assert!(backend.start());
        backend.pause();
        assert!(backend.resume());
        backend.stop();
        assert!(backend.is_idle());
        assert_eq!(backend.mode(), OutputMode::Simple);
        assert!(!backend.host_stream_stopped());
    }

    #[test]
    fn simple_backend_stop_is_idempotent() {
        let Some(mut backend) = try_simple() else {
            eprintln!("no output device; skipping");
            return;
        };
        backend.attach(boxed(1, 44100, vec![0.0; 1024]));
        backend.stop();
        backend.stop();
        assert!(backend.is_idle());
    }

    #[test]
    fn callback_backend_lifecycle() {
        let Some(mut backend) = try_callback(OutputMode::CallbackShared) else {
            eprintln!("no output device; skipping");
            return;
        };
        assert!(backend.is_idle());
        assert!(!backend.start(), "start without attach must fail");

        if backend.attach(boxed(2, 44100, vec![0.0; 8192])) {
            assert!(!backend.is_idle());
            assert!(backend.start());
            backend.pause();
            assert!(backend.resume());
            backend.stop();
            assert!(backend.is_idle());
        }
        assert_eq!(backend.mode(), OutputMode::CallbackShared);
    }

    #[test]
    fn callback_backend_seek_repositions_source() {
        let Some(mut backend) = try_callback(OutputMode::CallbackShared) else {
            eprintln!("no output device; skipping");
            return;
        };
        if backend.attach(boxed(1, 44100, vec![0.25; 44100])) {
            // SamplesBuffer supports seeking within its span
            assert!(backend.seek(0.5));
        }
    }

    #[test]
    fn create_backend_selects_by_mode() {
        let Some(_) = try_simple() else {
            eprintln!("no output device; skipping");
            return;
        };
        let simple = create_backend(OutputMode::Simple, None);
        assert!(simple.is_ok());
        assert_eq!(simple.as_ref().map(|b| b.mode()).ok(), Some(OutputMode::Simple));

        if let Ok(cb) = create_backend(OutputMode::CallbackShared, None) {
            assert_eq!(cb.mode(), OutputMode::CallbackShared);
        }
    }

    #[test]
    fn unknown_device_name_is_reported() {
        let err = find_device(Some("no-such-device-name"));
        assert!(err.is_err());
    }
}
