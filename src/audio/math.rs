//! Signal math helpers
//!
//! Pure numeric functions shared by the equalizer and the analyzer.
//! No state, no hardware dependency.

use crate::config::equalizer::{DEFAULT_BANDWIDTH_OCT, GAIN_MAX_DB, GAIN_MIN_DB};

/// Map a frequency to its FFT bin index.
///
/// `bin_width = sample_rate / fft_size`, `index = frequency / bin_width`,
/// clamped to `[0, fft_size/2 - 1]`. Any non-positive input yields 0.
pub fn fft_bin_index(sample_rate_hz: f32, frequency_hz: f32, fft_size: usize) -> usize {
    if sample_rate_hz <= 0.0 || frequency_hz <= 0.0 || fft_size == 0 {
        return 0;
    }
    let bin_width = sample_rate_hz / fft_size as f32;
    let index = (frequency_hz / bin_width) as usize;
    index.min(fft_size / 2 - 1)
}

/// Clamp an equalizer gain to the supported range (dB)
pub fn clamp_gain_db(value: f32) -> f32 {
    value.clamp(GAIN_MIN_DB, GAIN_MAX_DB)
}

/// Convert a bandwidth in octaves to a filter Q value.
///
/// Audio EQ Cookbook relation: `Q = sqrt(2^bw) / (2^bw - 1)`.
/// Non-positive bandwidth falls back to the default one-octave width.
pub fn bandwidth_octaves_to_q(bandwidth_oct: f32) -> f32 {
    let bw = if bandwidth_oct > 0.0 {
        bandwidth_oct
    } else {
        DEFAULT_BANDWIDTH_OCT
    };
    let pow = 2f32.powf(bw);
    pow.sqrt() / (pow - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // --- fft_bin_index ---

    #[test]
    fn bin_index_known_values() {
        assert_eq!(fft_bin_index(44100.0, 1000.0, 2048), 46);
        assert_eq!(fft_bin_index(48000.0, 1000.0, 2048), 42);
    }

    #[test]
    fn bin_index_zero_frequency_is_zero() {
        assert_eq!(fft_bin_index(44100.0, 0.0, 2048), 0);
    }

    #[test]
    fn bin_index_non_positive_inputs_are_zero() {
        assert_eq!(fft_bin_index(-44100.0, 1000.0, 2048), 0);
        assert_eq!(fft_bin_index(0.0, 1000.0, 2048), 0);
        assert_eq!(fft_bin_index(44100.0, -1.0, 2048), 0);
        assert_eq!(fft_bin_index(44100.0, 1000.0, 0), 0);
    }

    #[test]
    fn bin_index_clamped_to_half_spectrum() {
        // Way above Nyquist
        assert_eq!(fft_bin_index(44100.0, 1_000_000.0, 2048), 1023);
        // Exactly Nyquist lands on the clamp too
        assert_eq!(fft_bin_index(44100.0, 22050.0, 2048), 1023);
    }

    #[test]
    fn bin_index_always_in_range() {
        for freq in [1.0, 20.0, 440.0, 10_000.0, 22_050.0, 96_000.0] {
            for rate in [8000.0, 22050.0, 44100.0, 48000.0, 192_000.0] {
                for size in [256usize, 512, 1024, 2048, 4096] {
                    let idx = fft_bin_index(rate, freq, size);
                    assert!(idx < size / 2, "idx={} rate={} freq={}", idx, rate, freq);
                }
            }
        }
    }

    #[test]
    fn bin_index_low_frequency_maps_low() {
        let low = fft_bin_index(44100.0, 32.0, 2048);
        let high = fft_bin_index(44100.0, 16000.0, 2048);
        assert!(low < high);
        assert!(low <= 2);
    }

    // --- clamp_gain_db ---

    #[test]
    fn clamp_gain_limits() {
        assert_eq!(clamp_gain_db(-20.0), -12.0);
        assert_eq!(clamp_gain_db(20.0), 12.0);
    }

    #[test]
    fn clamp_gain_identity_inside_range() {
        for v in [-12.0f32, -6.5, 0.0, 3.25, 11.99, 12.0] {
            assert_eq!(clamp_gain_db(v), v);
        }
    }

    #[test]
    fn clamp_gain_always_in_range() {
        for v in [-1e9f32, -13.0, -12.0001, 12.0001, 13.0, 1e9] {
            let g = clamp_gain_db(v);
            assert!((-12.0..=12.0).contains(&g), "gain {} out of range", g);
        }
    }

    // --- bandwidth_octaves_to_q ---

    #[test]
    fn one_octave_q() {
        // sqrt(2) / (2 - 1) = 1.4142...
        assert_relative_eq!(bandwidth_octaves_to_q(1.0), 1.414_213_5, epsilon = 1e-5);
    }

    #[test]
    fn narrower_bandwidth_gives_higher_q() {
        assert!(bandwidth_octaves_to_q(0.5) > bandwidth_octaves_to_q(1.0));
        assert!(bandwidth_octaves_to_q(1.0) > bandwidth_octaves_to_q(2.0));
    }

    #[test]
    fn non_positive_bandwidth_falls_back_to_default() {
        assert_eq!(bandwidth_octaves_to_q(0.0), bandwidth_octaves_to_q(1.0));
        assert_eq!(bandwidth_octaves_to_q(-3.0), bandwidth_octaves_to_q(1.0));
    }
}
