// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Display gain shaping for spectrum bins and signal-quality values.
//!
//! Master gain is applied where bins are converted to dB; per-range
//! gain is applied by the consumer so the same bin array can be shared.
//! Both also adjust the basebandPower/noiseDensity numbers handed to
//! audio clients, keeping the S-meter consistent with the spectrum
//! display.

use crate::config::GainRange;

/// Floor used for bins reporting zero or negative linear power.
pub const BIN_FLOOR_DB: f32 = -120.0;

/// Convert linear bin powers to dB and apply master gain in place.
pub fn bins_to_db(bins: &mut [f32], master_gain_db: f32) {
    for p in bins.iter_mut() {
        *p = if *p > 0.0 {
            10.0 * p.log10() + master_gain_db
        } else {
            BIN_FLOOR_DB + master_gain_db
        };
    }
}

/// Gain contribution of the configured frequency ranges at `freq_hz`,
/// with linear ramps of `transition_hz` width outside each range's
/// edges. Overlapping ranges sum.
pub fn range_gain_db(ranges: &[GainRange], freq_hz: f64) -> f32 {
    let mut gain = 0.0f32;
    for r in ranges {
        if freq_hz >= r.start_freq && freq_hz <= r.end_freq {
            gain += r.gain_db;
        } else if r.transition_hz > 0.0 {
            let dist = if freq_hz < r.start_freq {
                r.start_freq - freq_hz
            } else {
                freq_hz - r.end_freq
            };
            if dist < r.transition_hz {
                let ramp = 1.0 - dist / r.transition_hz;
                gain += r.gain_db * ramp as f32;
            }
        }
    }
    gain
}

/// Frequency of bin `index` in FFT order: the first half of the array
/// holds positive offsets from center, the second half negative.
pub fn bin_frequency(center_hz: f64, index: usize, bin_count: usize, bin_bandwidth_hz: f64) -> f64 {
    let half = bin_count / 2;
    if index < half {
        center_hz + index as f64 * bin_bandwidth_hz
    } else {
        center_hz + (index as f64 - bin_count as f64) * bin_bandwidth_hz
    }
}

/// Apply per-range gain to a dB bin array in place.
pub fn apply_range_gain(
    bins: &mut [f32],
    ranges: &[GainRange],
    center_hz: f64,
    bin_bandwidth_hz: f64,
) {
    if ranges.is_empty() {
        return;
    }
    let n = bins.len();
    for (i, b) in bins.iter_mut().enumerate() {
        let f = bin_frequency(center_hz, i, n, bin_bandwidth_hz);
        *b += range_gain_db(ranges, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: f64, end: f64, gain: f32, transition: f64) -> GainRange {
        GainRange {
            start_freq: start,
            end_freq: end,
            gain_db: gain,
            transition_hz: transition,
        }
    }

    #[test]
    fn zero_power_hits_the_floor() {
        let mut bins = vec![0.0f32, -1.0, 1.0];
        bins_to_db(&mut bins, 0.0);
        assert_eq!(bins[0], BIN_FLOOR_DB);
        assert_eq!(bins[1], BIN_FLOOR_DB);
        assert_eq!(bins[2], 0.0);
    }

    #[test]
    fn master_gain_offsets_every_bin() {
        let mut bins = vec![1.0f32, 10.0];
        bins_to_db(&mut bins, 6.0);
        assert!((bins[0] - 6.0).abs() < 1e-4);
        assert!((bins[1] - 16.0).abs() < 1e-4);
    }

    #[test]
    fn range_gain_is_flat_inside() {
        let ranges = [range(7_000_000.0, 7_200_000.0, 10.0, 10_000.0)];
        assert_eq!(range_gain_db(&ranges, 7_100_000.0), 10.0);
        assert_eq!(range_gain_db(&ranges, 7_000_000.0), 10.0);
        assert_eq!(range_gain_db(&ranges, 7_200_000.0), 10.0);
    }

    #[test]
    fn range_gain_ramps_linearly_at_edges() {
        let ranges = [range(7_000_000.0, 7_200_000.0, 10.0, 10_000.0)];
        let half = range_gain_db(&ranges, 6_995_000.0);
        assert!((half - 5.0).abs() < 1e-3, "got {half}");
        let outside = range_gain_db(&ranges, 6_989_999.0);
        assert_eq!(outside, 0.0);
    }

    #[test]
    fn bin_frequency_follows_fft_order() {
        // 8 bins, 100 Hz each, centered at 10 kHz.
        let f0 = bin_frequency(10_000.0, 0, 8, 100.0);
        let f3 = bin_frequency(10_000.0, 3, 8, 100.0);
        let f4 = bin_frequency(10_000.0, 4, 8, 100.0);
        let f7 = bin_frequency(10_000.0, 7, 8, 100.0);
        assert_eq!(f0, 10_000.0);
        assert_eq!(f3, 10_300.0);
        assert_eq!(f4, 9_600.0);
        assert_eq!(f7, 9_900.0);
    }

    #[test]
    fn apply_range_gain_only_touches_matching_bins() {
        let ranges = [range(10_250.0, 10_350.0, 12.0, 0.0)];
        let mut bins = vec![0.0f32; 8];
        apply_range_gain(&mut bins, &ranges, 10_000.0, 100.0);
        assert_eq!(bins[3], 12.0); // 10_300 Hz
        assert_eq!(bins[0], 0.0);
        assert_eq!(bins[7], 0.0);
    }
}
