// Heart-rate trace derived from R-peak indices

use crate::core::constants::{HR_SIGNAL_NAME, HR_UNITS};
use crate::core::error::{Result, StoreError};
use crate::core::signal::Signal;

/// Options for [`derive_heart_rate_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HrDerivation {
    /// Added to every time value, in seconds.
    pub time_offset: f64,
    /// Rates below this become NaN.
    pub min_bpm: Option<f64>,
    /// Rates above this become NaN.
    pub max_bpm: Option<f64>,
}

/// Piecewise-constant heart rate between consecutive peaks.
///
/// Every sample index in `[peaks[i], peaks[i + 1])` gets `60 / rr` with
/// `rr = (peaks[i + 1] - peaks[i]) / fs` (0 when `rr <= 0`) and time
/// `index / fs`. Fewer than two peaks give an empty signal.
pub fn derive_heart_rate(peaks: &[usize], fs: f64) -> Result<Signal> {
    derive_heart_rate_with(peaks, fs, &HrDerivation::default())
}

pub fn derive_heart_rate_with(peaks: &[usize], fs: f64, options: &HrDerivation) -> Result<Signal> {
    if !(fs.is_finite() && fs > 0.0) {
        return Err(StoreError::InvalidInput(format!(
            "sampling rate must be positive, got {}",
            fs
        )));
    }

    let span = match (peaks.first(), peaks.last()) {
        (Some(first), Some(last)) if peaks.len() >= 2 => last.saturating_sub(*first),
        _ => 0,
    };
    let mut hr = Vec::with_capacity(span);
    let mut time = Vec::with_capacity(span);

    for pair in peaks.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        let rr = (end as f64 - start as f64) / fs;
        let mut bpm = if rr > 0.0 { 60.0 / rr } else { 0.0 };
        if options.min_bpm.is_some_and(|lo| bpm < lo) || options.max_bpm.is_some_and(|hi| bpm > hi) {
            bpm = f64::NAN;
        }
        for idx in start..end {
            hr.push(bpm);
            time.push(idx as f64 / fs + options.time_offset);
        }
    }

    Signal::explicit(HR_SIGNAL_NAME, hr, time, 1.0, HR_UNITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::Timebase;

    #[test]
    fn test_piecewise_rates() {
        let sig = derive_heart_rate(&[100, 150, 225], 50.0).unwrap();
        assert_eq!(sig.name(), "HR");
        assert_eq!(sig.units(), "bpm");
        assert_eq!(sig.fs(), 1.0);
        assert_eq!(sig.timebase(), Timebase::Explicit);
        assert_eq!(sig.len(), 125);

        assert!(sig.samples()[..50].iter().all(|&v| v == 30.0));
        assert!(sig.samples()[50..].iter().all(|&v| v == 40.0));
        assert_eq!(sig.time()[0], 2.0);
        assert_eq!(sig.time()[50], 3.0);
        assert_eq!(sig.time()[124], 224.0 / 50.0);
    }

    #[test]
    fn test_fewer_than_two_peaks() {
        assert!(derive_heart_rate(&[], 50.0).unwrap().is_empty());
        assert!(derive_heart_rate(&[100], 50.0).unwrap().is_empty());
    }

    #[test]
    fn test_deterministic() {
        let a = derive_heart_rate(&[10, 90, 170, 240], 100.0).unwrap();
        let b = derive_heart_rate(&[10, 90, 170, 240], 100.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_peaks_yield_no_samples() {
        // zero-length interval contributes nothing
        let sig = derive_heart_rate(&[5, 5, 10], 5.0).unwrap();
        assert_eq!(sig.len(), 5);
        assert!(sig.samples().iter().all(|&v| v == 60.0));
    }

    #[test]
    fn test_offset_and_limits() {
        let options = HrDerivation {
            time_offset: -1.0,
            min_bpm: Some(35.0),
            max_bpm: None,
        };
        let sig = derive_heart_rate_with(&[100, 150, 225], 50.0, &options).unwrap();
        assert!(sig.samples()[0].is_nan());
        assert_eq!(sig.samples()[50], 40.0);
        assert_eq!(sig.time()[0], 1.0);
    }

    #[test]
    fn test_rejects_bad_rate() {
        assert!(derive_heart_rate(&[1, 2], 0.0).is_err());
    }
}
