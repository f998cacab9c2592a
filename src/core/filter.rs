// Butterworth band-pass as cascaded second-order sections

use crate::core::error::{Result, StoreError};
use std::f64::consts::PI;

/// Second-order section coefficients.
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }
}

/// One section in Direct Form II Transposed.
#[derive(Debug, Clone)]
struct Biquad {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f64) -> f64 {
        let c = &self.coeffs;
        let output = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        self.z2 = c.b2 * input - c.a2 * output;
        output
    }

    /// Puts the section in the state it reaches after a constant `input`,
    /// returning its steady output.
    fn settle(&mut self, input: f64) -> f64 {
        let c = self.coeffs;
        let output = c.dc_gain() * input;
        self.z2 = c.b2 * input - c.a2 * output;
        self.z1 = c.b1 * input - c.a1 * output + self.z2;
        output
    }
}

/// Cascade of second-order sections.
#[derive(Debug, Clone, PartialEq)]
pub struct SosFilter {
    sections: Vec<BiquadCoeffs>,
}

impl SosFilter {
    /// Butterworth band-pass of the given order on each edge: a high-pass at
    /// `low_hz` followed by a low-pass at `high_hz`, both prewarped for the
    /// bilinear transform.
    pub fn butterworth_bandpass(low_hz: f64, high_hz: f64, fs: f64, order: usize) -> Result<Self> {
        if !(fs.is_finite() && fs > 0.0) {
            return Err(StoreError::InvalidInput(format!(
                "sampling rate must be positive, got {}",
                fs
            )));
        }
        if order == 0 {
            return Err(StoreError::invalid_param("order", "must be at least 1"));
        }
        let nyquist = fs / 2.0;
        if !(low_hz > 0.0 && low_hz < high_hz && high_hz < nyquist) {
            return Err(StoreError::InvalidInput(format!(
                "band [{}, {}] Hz must satisfy 0 < low < high < {}",
                low_hz, high_hz, nyquist
            )));
        }

        let mut sections = butterworth_sections(prewarp(low_hz, fs), order, true);
        sections.extend(butterworth_sections(prewarp(high_hz, fs), order, false));
        Ok(Self { sections })
    }

    pub fn sections(&self) -> &[BiquadCoeffs] {
        &self.sections
    }

    /// Causal pass, started in the steady state of the first sample.
    pub fn filter(&self, signal: &[f64]) -> Vec<f64> {
        let Some(&first) = signal.first() else {
            return Vec::new();
        };
        let mut stages: Vec<Biquad> = self.sections.iter().copied().map(Biquad::new).collect();
        let mut x = first;
        for stage in &mut stages {
            x = stage.settle(x);
        }

        signal
            .iter()
            .map(|&s| stages.iter_mut().fold(s, |acc, stage| stage.process(acc)))
            .collect()
    }

    /// Zero-phase filtering: forward then backward over an odd extension of
    /// both ends, so output peaks stay on input peaks.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n == 0 {
            return Vec::new();
        }
        let pad = (3 * (2 * self.sections.len() + 1)).min(n - 1);
        let (first, last) = (signal[0], signal[n - 1]);

        let mut extended = Vec::with_capacity(n + 2 * pad);
        extended.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
        extended.extend_from_slice(signal);
        extended.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

        let mut forward = self.filter(&extended);
        forward.reverse();
        let mut backward = self.filter(&forward);
        backward.reverse();
        backward.drain(..pad);
        backward.truncate(n);
        backward
    }
}

fn prewarp(freq: f64, fs: f64) -> f64 {
    (PI * freq / fs).tan()
}

/// Sections of an `order`-pole Butterworth edge at prewarped frequency `k`.
fn butterworth_sections(k: f64, order: usize, highpass: bool) -> Vec<BiquadCoeffs> {
    let mut sections = Vec::with_capacity((order + 1) / 2);
    let k2 = k * k;

    for i in 0..order / 2 {
        // conjugate pole pair of s^2 + d*s + 1
        let d = 2.0 * (PI * (2 * i + 1) as f64 / (2 * order) as f64).sin();
        let denom = 1.0 + d * k + k2;
        let (b0, b1, b2) = if highpass {
            (1.0 / denom, -2.0 / denom, 1.0 / denom)
        } else {
            (k2 / denom, 2.0 * k2 / denom, k2 / denom)
        };
        sections.push(BiquadCoeffs {
            b0,
            b1,
            b2,
            a1: 2.0 * (k2 - 1.0) / denom,
            a2: (1.0 - d * k + k2) / denom,
        });
    }

    if order % 2 == 1 {
        let denom = 1.0 + k;
        let (b0, b1) = if highpass {
            (1.0 / denom, -1.0 / denom)
        } else {
            (k / denom, k / denom)
        };
        sections.push(BiquadCoeffs {
            b0,
            b1,
            b2: 0.0,
            a1: (k - 1.0) / denom,
            a2: 0.0,
        });
    }

    sections
}
