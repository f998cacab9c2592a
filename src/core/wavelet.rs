// Wavelet filter banks used by the R-peak detectors
//
// Discrete transforms use periodic extension so every level is an orthogonal
// change of basis. Odd-length levels are padded by repeating the last sample
// and trimmed again on reconstruction.

use crate::core::error::{Result, StoreError};
use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Orthogonal discrete wavelet bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscreteWavelet {
    Haar,
    Db2,
    Db3,
    Db4,
    Sym4,
}

impl DiscreteWavelet {
    pub const NAMES: [&'static str; 6] = ["haar", "db1", "db2", "db3", "db4", "sym4"];

    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "haar" | "db1" => Ok(DiscreteWavelet::Haar),
            "db2" => Ok(DiscreteWavelet::Db2),
            "db3" => Ok(DiscreteWavelet::Db3),
            "db4" => Ok(DiscreteWavelet::Db4),
            "sym4" => Ok(DiscreteWavelet::Sym4),
            _ => Err(StoreError::UnsupportedWavelet(name.to_string())),
        }
    }

    /// Lowpass decomposition taps.
    fn lowpass(&self) -> Vec<f64> {
        match self {
            DiscreteWavelet::Haar => vec![FRAC_1_SQRT_2, FRAC_1_SQRT_2],
            DiscreteWavelet::Db2 => vec![
                -0.12940952255092145,
                0.22414386804185735,
                0.836516303737469,
                0.48296291314469025,
            ],
            DiscreteWavelet::Db3 => vec![
                0.035226291885709536,
                -0.08544127388202666,
                -0.13501102001025458,
                0.45987750211849154,
                0.8068915093110925,
                0.33267055295008263,
            ],
            DiscreteWavelet::Db4 => vec![
                -0.010597401785069032,
                0.0328830116668852,
                0.030841381835560764,
                -0.18703481171909309,
                -0.027983769416859854,
                0.6308807679298589,
                0.7148465705529157,
                0.2303778133088965,
            ],
            DiscreteWavelet::Sym4 => vec![
                -0.07576571478927333,
                -0.02963552764599851,
                0.49761866763201545,
                0.8037387518059161,
                0.29785779560527736,
                -0.09921954357684722,
                -0.012603967262037833,
                0.032223100604042702,
            ],
        }
    }
}

/// Analysis/synthesis filter pair for an orthogonal basis.
#[derive(Debug, Clone)]
pub struct FilterBank {
    pub lo: Vec<f64>,
    pub hi: Vec<f64>,
}

impl FilterBank {
    pub fn new(wavelet: DiscreteWavelet) -> Self {
        let lo = wavelet.lowpass();
        let n = lo.len();
        // QMF: hi[k] = (-1)^k * lo[n-1-k]
        let hi = (0..n)
            .map(|k| if k % 2 == 0 { lo[n - 1 - k] } else { -lo[n - 1 - k] })
            .collect();
        Self { lo, hi }
    }

    pub fn len(&self) -> usize {
        self.lo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lo.is_empty()
    }
}

/// Deepest useful decomposition for a signal of `len` samples, never below 1
/// once there are at least two samples.
pub fn max_level(len: usize, filter_len: usize) -> usize {
    if len < 2 {
        return 0;
    }
    let span = filter_len.saturating_sub(1).max(1);
    if len < span {
        return 1;
    }
    ((len / span) as f64).log2().floor().max(1.0) as usize
}

/// Multilevel decomposition result, details ordered finest first.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub approximation: Vec<f64>,
    pub details: Vec<Vec<f64>>,
    /// Input length at each level before padding, finest first.
    lengths: Vec<usize>,
}

impl Decomposition {
    pub fn levels(&self) -> usize {
        self.details.len()
    }
}

fn analyze_step(x: &[f64], bank: &FilterBank) -> (Vec<f64>, Vec<f64>) {
    let n = x.len();
    let half = n / 2;
    let mut approx = vec![0.0; half];
    let mut detail = vec![0.0; half];
    for i in 0..half {
        let (mut a, mut d) = (0.0, 0.0);
        for (k, (lo, hi)) in bank.lo.iter().zip(&bank.hi).enumerate() {
            let v = x[(2 * i + k) % n];
            a += lo * v;
            d += hi * v;
        }
        approx[i] = a;
        detail[i] = d;
    }
    (approx, detail)
}

fn synthesize_step(approx: &[f64], detail: &[f64], bank: &FilterBank) -> Vec<f64> {
    let n = approx.len() * 2;
    let mut out = vec![0.0; n];
    for i in 0..approx.len() {
        for (k, (lo, hi)) in bank.lo.iter().zip(&bank.hi).enumerate() {
            out[(2 * i + k) % n] += lo * approx[i] + hi * detail[i];
        }
    }
    out
}

/// Periodized multilevel DWT. `level` must already be within
/// [`max_level`]; callers clamp before calling.
pub fn wavedec(signal: &[f64], bank: &FilterBank, level: usize) -> Decomposition {
    let mut current = signal.to_vec();
    let mut details = Vec::with_capacity(level);
    let mut lengths = Vec::with_capacity(level);

    for _ in 0..level {
        lengths.push(current.len());
        if current.len() % 2 == 1 {
            if let Some(&last) = current.last() {
                current.push(last);
            }
        }
        let (approx, detail) = analyze_step(&current, bank);
        details.push(detail);
        current = approx;
    }

    Decomposition {
        approximation: current,
        details,
        lengths,
    }
}

pub fn waverec(decomposition: &Decomposition, bank: &FilterBank) -> Vec<f64> {
    let mut current = decomposition.approximation.clone();
    for (detail, &len) in decomposition
        .details
        .iter()
        .zip(&decomposition.lengths)
        .rev()
    {
        current = synthesize_step(&current, detail, bank);
        current.truncate(len);
    }
    current
}

/// Reconstruction from detail bands only. Zeroing the approximation removes
/// baseline wander and leaves the sharp QRS energy.
pub fn detail_reconstruction(signal: &[f64], bank: &FilterBank, level: usize) -> Vec<f64> {
    let mut decomposition = wavedec(signal, bank, level);
    decomposition.approximation.iter_mut().for_each(|a| *a = 0.0);
    waverec(&decomposition, bank)
}

/// Level-`level` smooth of the undecimated (à trous) transform, circular
/// boundary. The lowpass is rescaled to unit gain.
pub fn swt_smooth(signal: &[f64], bank: &FilterBank, level: usize) -> Vec<f64> {
    let n = signal.len();
    let taps: Vec<f64> = bank.lo.iter().map(|h| h * FRAC_1_SQRT_2).collect();
    let mut current = signal.to_vec();
    for j in 0..level {
        let step = 1usize << j;
        let mut next = vec![0.0; n];
        for (i, out) in next.iter_mut().enumerate() {
            *out = taps
                .iter()
                .enumerate()
                .map(|(k, h)| h * current[(i + k * step) % n])
                .sum();
        }
        current = next;
    }
    current
}

/// Sum of all SWT detail bands up to `level`, i.e. the signal minus its
/// level-`level` smooth.
pub fn swt_details(signal: &[f64], bank: &FilterBank, level: usize) -> Vec<f64> {
    let smooth = swt_smooth(signal, bank, level);
    signal.iter().zip(&smooth).map(|(x, s)| x - s).collect()
}

/// Real-valued mother wavelets for the continuous transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuousWavelet {
    MexicanHat,
    Morlet,
}

impl ContinuousWavelet {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mexh" | "ricker" => Ok(ContinuousWavelet::MexicanHat),
            "morl" | "morlet" => Ok(ContinuousWavelet::Morlet),
            _ => Err(StoreError::UnsupportedWavelet(name.to_string())),
        }
    }

    fn psi(&self, t: f64) -> f64 {
        match self {
            ContinuousWavelet::MexicanHat => {
                let norm = 2.0 / (3.0_f64.sqrt() * PI.powf(0.25));
                norm * (1.0 - t * t) * (-t * t / 2.0).exp()
            }
            ContinuousWavelet::Morlet => (-t * t / 2.0).exp() * (5.0 * t).cos(),
        }
    }

    /// Effective support half-width in units of scale.
    fn support(&self) -> f64 {
        match self {
            ContinuousWavelet::MexicanHat => 5.0,
            ContinuousWavelet::Morlet => 4.0,
        }
    }
}

/// Continuous transform at one scale, truncated to the wavelet's support.
pub fn cwt_at_scale(signal: &[f64], wavelet: ContinuousWavelet, scale: f64) -> Vec<f64> {
    let half = (wavelet.support() * scale).ceil() as isize;
    let kernel: Vec<f64> = (-half..=half)
        .map(|m| wavelet.psi(m as f64 / scale))
        .collect();
    let norm = 1.0 / scale.sqrt();
    let n = signal.len() as isize;

    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            for (j, w) in kernel.iter().enumerate() {
                let idx = i + j as isize - half;
                if idx >= 0 && idx < n {
                    acc += w * signal[idx as usize];
                }
            }
            acc * norm
        })
        .collect()
}

/// Scales matching QRS complexes of 80–120 ms at `fs`.
pub fn qrs_scales(fs: f64) -> Vec<f64> {
    let min_scale = ((0.08 * fs / 4.0) as usize).max(1);
    let max_scale = ((0.12 * fs / 2.0) as usize).max(min_scale + 1);
    let step = ((max_scale - min_scale) / 20).max(1);
    (min_scale..max_scale)
        .step_by(step)
        .map(|s| s as f64)
        .collect()
}
