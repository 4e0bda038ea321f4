//! Configuration constants for the tonearm engine

/// Audio analysis configuration
pub mod audio {
    /// FFT window size for visualization
    pub const FFT_SIZE: usize = 2048;

    /// Half-spectrum size published to consumers
    pub const SPECTRUM_BINS: usize = FFT_SIZE / 2;

    /// Number of visual bars the half-spectrum is bucketed into
    pub const SPECTRUM_BARS: usize = 32;

    /// Bins below this level are zeroed before bucketing (dB)
    pub const NOISE_FLOOR_DB: f32 = -60.0;

    /// Level assigned to silence instead of log(0) (dB)
    pub const SILENCE_FLOOR_DB: f32 = -120.0;

    /// Magnitude floor fed to the log conversion to avoid -infinity
    pub const MAGNITUDE_FLOOR: f32 = 1e-5;

    /// Full-scale reference for 16-bit peak levels
    pub const PEAK_FULL_SCALE: f32 = 32768.0;
}

/// Equalizer configuration
pub mod equalizer {
    /// Fixed ISO-like band centers, low to high (Hz)
    pub const BAND_CENTERS_HZ: [f32; 10] = [
        32.0, 64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
    ];

    /// Number of bands
    pub const BAND_COUNT: usize = BAND_CENTERS_HZ.len();

    /// Gain range per band (dB)
    pub const GAIN_MIN_DB: f32 = -12.0;
    pub const GAIN_MAX_DB: f32 = 12.0;

    /// Default bandwidth per band (octaves)
    pub const DEFAULT_BANDWIDTH_OCT: f32 = 1.0;

    /// Tolerance for matching a band by center frequency (Hz)
    pub const CENTER_MATCH_TOLERANCE_HZ: f32 = 0.1;

    /// Samples between coefficient-refresh checks in the audio path
    pub const REFRESH_INTERVAL_SAMPLES: u64 = 512;
}

/// Device health configuration
pub mod health {
    /// Consecutive non-busy errors tolerated before the device is marked lost
    pub const TRANSIENT_ERROR_THRESHOLD: u32 = 3;
}

/// Output backend configuration
pub mod backend {
    /// Requested frames per buffer for the bounded-latency callback steps
    pub const CALLBACK_BUFFER_FRAMES: u32 = 1024;

    /// Assumed sample rate when no stream is loaded to report one
    pub const FALLBACK_SAMPLE_RATE: u32 = 44100;
}

/// Engine timing configuration
pub mod timing {
    /// Tick interval driving position updates and spectrum computation (ms)
    pub const TICK_INTERVAL_MS: u64 = 50;

    /// Command channel capacity
    pub const COMMAND_QUEUE_LEN: usize = 16;

    /// Event channel capacity
    pub const EVENT_QUEUE_LEN: usize = 64;
}
