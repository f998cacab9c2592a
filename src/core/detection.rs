// R-peak detection: strategy trait, built-in detectors and the registry

use crate::core::constants::*;
use crate::core::error::{Result, StoreError};
use crate::core::filter::SosFilter;
use crate::core::params::{ParamValue, Params};
use crate::core::wavelet::{self, ContinuousWavelet, DiscreteWavelet, FilterBank};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Deprecated method names and their replacements.
pub const METHOD_ALIASES: &[(&str, &str)] = &[("wavelet", "dwt"), ("simple_threshold", "threshold")];

/// Deprecated parameter names and their replacements.
pub const PARAM_ALIASES: &[(&str, &str)] = &[
    ("swt_level", "level"),
    ("wavelet_level", "level"),
    ("min_distance_sec", "min_rr_sec"),
    ("wavelet_type", "wavelet"),
    ("height_threshold_std", "height_std"),
    ("threshold_std_multiplier", "threshold_std"),
];

const DEFAULT_THRESHOLD_STD: f64 = 2.0;
const DEFAULT_CWT_WAVELET: &str = "mexh";
const DEFAULT_BANDPASS_MIN_RR_SEC: f64 = 0.4;
const DEFAULT_LOW_CUTOFF_HZ: f64 = 0.5;
const DEFAULT_HIGH_CUTOFF_HZ: f64 = 40.0;
const BANDPASS_ORDER: usize = 4;

/// Signal type every detector without a narrower declaration accepts.
pub const GENERIC_SIGNAL_TYPE: &str = "generic";
const CARDIAC_SIGNAL_TYPES: &[&str] = &["ecg", "blood_pressure", GENERIC_SIGNAL_TYPE];

/// Non-fatal condition reported alongside a detection result.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionWarning {
    LevelClamped { requested: i64, used: usize },
    FellBack { from: String, to: String, reason: String },
    DeprecatedMethod { alias: String, canonical: String },
    DeprecatedParam { alias: String, canonical: String },
    FilterSkipped { reason: String },
}

impl fmt::Display for DetectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionWarning::LevelClamped { requested, used } => write!(
                f,
                "decomposition level {} exceeds signal length, using {}",
                requested, used
            ),
            DetectionWarning::FellBack { from, to, reason } => {
                write!(f, "{} failed ({}), fell back to {}", from, reason, to)
            }
            DetectionWarning::DeprecatedMethod { alias, canonical } => {
                write!(f, "method {:?} is deprecated, use {:?}", alias, canonical)
            }
            DetectionWarning::DeprecatedParam { alias, canonical } => {
                write!(f, "parameter {:?} is deprecated, use {:?}", alias, canonical)
            }
            DetectionWarning::FilterSkipped { reason } => {
                write!(f, "filtering failed ({}), using the unfiltered signal", reason)
            }
        }
    }
}

/// Peak indices plus whatever the detector had to adjust to produce them.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub peaks: Vec<usize>,
    pub warnings: Vec<DetectionWarning>,
    /// Detector that actually produced the peaks.
    pub method: String,
}

impl Detection {
    fn new(method: &str, peaks: Vec<usize>, warnings: Vec<DetectionWarning>) -> Self {
        Self {
            peaks,
            warnings,
            method: method.to_string(),
        }
    }
}

/// A pluggable R-peak detection algorithm.
///
/// Implementations receive parameters that already went through alias
/// translation and must ignore keys they do not recognize.
pub trait PeakDetector: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn default_params(&self) -> Params;

    /// Signal types this detector handles.
    fn signal_types(&self) -> &[&str] {
        &[GENERIC_SIGNAL_TYPE]
    }

    fn detect(&self, samples: &[f64], fs: f64, params: &Params) -> Result<Detection>;
}

/// Local maxima of `trace` at least `distance` samples apart.
///
/// A sample is a candidate only if it is strictly greater than both
/// neighbours and, when `height` is given, not below it. Candidates closer
/// than `distance` are resolved by keeping the higher one; equal heights keep
/// the earlier index. Peaks exactly `distance` apart are both kept.
pub fn find_peaks(trace: &[f64], distance: usize, height: Option<f64>) -> Vec<usize> {
    if trace.len() < 3 {
        return Vec::new();
    }

    let candidates: Vec<usize> = (1..trace.len() - 1)
        .filter(|&i| trace[i] > trace[i - 1] && trace[i] > trace[i + 1])
        .filter(|&i| height.map_or(true, |h| trace[i] >= h))
        .collect();

    if distance <= 1 || candidates.len() < 2 {
        return candidates;
    }

    let mut priority: Vec<usize> = (0..candidates.len()).collect();
    priority.sort_by(|&a, &b| {
        trace[candidates[b]]
            .total_cmp(&trace[candidates[a]])
            .then(candidates[a].cmp(&candidates[b]))
    });

    let mut keep = vec![true; candidates.len()];
    for &i in &priority {
        if !keep[i] {
            continue;
        }
        let peak = candidates[i];
        let mut j = i;
        while j > 0 && peak - candidates[j - 1] < distance {
            j -= 1;
            keep[j] = false;
        }
        let mut j = i + 1;
        while j < candidates.len() && candidates[j] - peak < distance {
            keep[j] = false;
            j += 1;
        }
    }

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(peak, kept)| kept.then_some(peak))
        .collect()
}

/// Refractory window in samples, never below one.
pub fn min_distance_samples(min_rr_sec: f64, fs: f64) -> usize {
    ((min_rr_sec * fs).floor() as usize).max(1)
}

fn mean_std(trace: &[f64]) -> (f64, f64) {
    if trace.is_empty() {
        return (0.0, 0.0);
    }
    let n = trace.len() as f64;
    let mean = trace.iter().sum::<f64>() / n;
    let var = trace.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Parameters shared by the wavelet detectors.
struct WaveletParams {
    wavelet: String,
    level: i64,
    min_rr_sec: f64,
    height_std: f64,
}

impl WaveletParams {
    fn parse(params: &Params, default_wavelet: &str) -> Result<Self> {
        let wavelet = params.str_or("wavelet", default_wavelet)?.to_string();
        let level = params.int_or("level", DEFAULT_LEVEL)?;
        if level < 1 {
            return Err(StoreError::invalid_param("level", format!("must be at least 1, got {}", level)));
        }
        let min_rr_sec = params.float_or("min_rr_sec", DEFAULT_MIN_RR_SEC)?;
        if !(min_rr_sec.is_finite() && min_rr_sec > 0.0) {
            return Err(StoreError::invalid_param(
                "min_rr_sec",
                format!("must be positive, got {}", min_rr_sec),
            ));
        }
        let height_std = params.float_or("height_std", DEFAULT_HEIGHT_STD)?;
        if !height_std.is_finite() {
            return Err(StoreError::invalid_param("height_std", "must be finite"));
        }
        Ok(Self {
            wavelet,
            level,
            min_rr_sec,
            height_std,
        })
    }

    fn peaks_on(&self, trace: &[f64], fs: f64) -> Vec<usize> {
        let (mean, std) = mean_std(trace);
        find_peaks(
            trace,
            min_distance_samples(self.min_rr_sec, fs),
            Some(mean + self.height_std * std),
        )
    }
}

/// Clamp a requested depth to what the signal length supports.
fn effective_level(
    requested: i64,
    len: usize,
    filter_len: usize,
    warnings: &mut Vec<DetectionWarning>,
) -> Result<usize> {
    let max = wavelet::max_level(len, filter_len);
    if max == 0 {
        return Err(StoreError::InvalidInput(format!(
            "{} samples are too few for a wavelet decomposition",
            len
        )));
    }
    let used = (requested as usize).min(max);
    if used as i64 != requested {
        warn!("Decomposition level {} clamped to {} for {} samples", requested, used, len);
        warnings.push(DetectionWarning::LevelClamped { requested, used });
    }
    Ok(used)
}

fn ensure_finite(method: &str, trace: &[f64]) -> Result<()> {
    if trace.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(StoreError::DetectionFailure {
            method: method.to_string(),
            reason: "transformed signal contains non-finite values".into(),
        })
    }
}

fn wavelet_defaults(wavelet: &str) -> Params {
    Params::new()
        .with("wavelet", wavelet)
        .with("level", DEFAULT_LEVEL)
        .with("min_rr_sec", DEFAULT_MIN_RR_SEC)
        .with("height_std", DEFAULT_HEIGHT_STD)
}

/// Multilevel DWT; peaks are searched on the detail-only reconstruction.
#[derive(Debug, Default)]
pub struct DwtDetector;

impl PeakDetector for DwtDetector {
    fn name(&self) -> &str {
        "dwt"
    }

    fn description(&self) -> &str {
        "Discrete wavelet transform - efficient, good baseline performance"
    }

    fn default_params(&self) -> Params {
        wavelet_defaults(DEFAULT_WAVELET)
    }

    fn signal_types(&self) -> &[&str] {
        CARDIAC_SIGNAL_TYPES
    }

    fn detect(&self, samples: &[f64], fs: f64, params: &Params) -> Result<Detection> {
        let p = WaveletParams::parse(params, DEFAULT_WAVELET)?;
        let bank = FilterBank::new(DiscreteWavelet::from_name(&p.wavelet)?);

        let mut warnings = Vec::new();
        let level = effective_level(p.level, samples.len(), bank.len(), &mut warnings)?;

        let trace = wavelet::detail_reconstruction(samples, &bank, level);
        ensure_finite(self.name(), &trace)?;
        Ok(Detection::new(self.name(), p.peaks_on(&trace, fs), warnings))
    }
}

/// Undecimated transform; shift invariant, slower than `dwt`.
#[derive(Debug, Default)]
pub struct SwtDetector;

impl PeakDetector for SwtDetector {
    fn name(&self) -> &str {
        "swt"
    }

    fn description(&self) -> &str {
        "Stationary wavelet transform - shift invariant, more robust to noise"
    }

    fn default_params(&self) -> Params {
        wavelet_defaults(DEFAULT_WAVELET)
    }

    fn detect(&self, samples: &[f64], fs: f64, params: &Params) -> Result<Detection> {
        let p = WaveletParams::parse(params, DEFAULT_WAVELET)?;
        let bank = FilterBank::new(DiscreteWavelet::from_name(&p.wavelet)?);

        let mut warnings = Vec::new();
        let level = effective_level(p.level, samples.len(), bank.len(), &mut warnings)?;

        let trace = wavelet::swt_details(samples, &bank, level);
        ensure_finite(self.name(), &trace)?;
        Ok(Detection::new(self.name(), p.peaks_on(&trace, fs), warnings))
    }
}

/// Continuous transform at QRS-sized scales. Any failure re-runs the request
/// through [`DwtDetector`] with the same parameters.
#[derive(Debug, Default)]
pub struct CwtDetector {
    fallback: DwtDetector,
}

impl CwtDetector {
    fn detect_cwt(&self, samples: &[f64], fs: f64, p: &WaveletParams) -> Result<Vec<usize>> {
        let mother = ContinuousWavelet::from_name(&p.wavelet)?;

        let mut best: Option<(f64, Vec<f64>)> = None;
        for scale in wavelet::qrs_scales(fs) {
            let magnitude: Vec<f64> = wavelet::cwt_at_scale(samples, mother, scale)
                .into_iter()
                .map(f64::abs)
                .collect();
            ensure_finite(self.name(), &magnitude)?;
            let energy: f64 = magnitude.iter().sum();
            if best.as_ref().map_or(true, |(e, _)| energy > *e) {
                best = Some((energy, magnitude));
            }
        }

        let (_, trace) = best.ok_or_else(|| StoreError::DetectionFailure {
            method: self.name().to_string(),
            reason: "no usable scales".into(),
        })?;
        Ok(p.peaks_on(&trace, fs))
    }
}

impl PeakDetector for CwtDetector {
    fn name(&self) -> &str {
        "cwt"
    }

    fn description(&self) -> &str {
        "Continuous wavelet transform - scale selected for QRS width, falls back to dwt"
    }

    fn default_params(&self) -> Params {
        wavelet_defaults(DEFAULT_CWT_WAVELET)
    }

    fn detect(&self, samples: &[f64], fs: f64, params: &Params) -> Result<Detection> {
        let p = WaveletParams::parse(params, DEFAULT_CWT_WAVELET)?;

        let reason = match self.detect_cwt(samples, fs, &p) {
            Ok(peaks) => return Ok(Detection::new(self.name(), peaks, Vec::new())),
            Err(e) => e.to_string(),
        };

        warn!("CWT detection failed ({}), falling back to dwt", reason);
        let mut fallback_params = params.clone();
        if DiscreteWavelet::from_name(&p.wavelet).is_err() {
            fallback_params.insert("wavelet", DEFAULT_WAVELET);
        }

        let mut detection = self
            .fallback
            .detect(samples, fs, &fallback_params)
            .map_err(|e| StoreError::DetectionFailure {
                method: self.name().to_string(),
                reason: format!("{}; fallback to dwt also failed: {}", reason, e),
            })?;
        detection.warnings.insert(
            0,
            DetectionWarning::FellBack {
                from: self.name().to_string(),
                to: self.fallback.name().to_string(),
                reason,
            },
        );
        Ok(detection)
    }
}

/// Dependency-free detector: strict local maxima above `mean + k·std` of the
/// raw samples. Suppression is sequential, so within a refractory window the
/// first peak encountered wins, and a following peak must be strictly more
/// than `min_rr_sec·fs` samples later.
#[derive(Debug, Default)]
pub struct ThresholdDetector;

impl PeakDetector for ThresholdDetector {
    fn name(&self) -> &str {
        "threshold"
    }

    fn description(&self) -> &str {
        "Simple threshold detection - no transform, basic functionality"
    }

    fn default_params(&self) -> Params {
        Params::new()
            .with("min_rr_sec", DEFAULT_MIN_RR_SEC)
            .with("threshold_std", DEFAULT_THRESHOLD_STD)
    }

    fn detect(&self, samples: &[f64], fs: f64, params: &Params) -> Result<Detection> {
        let k = params.float_or("threshold_std", DEFAULT_THRESHOLD_STD)?;
        let min_rr_sec = params.float_or("min_rr_sec", DEFAULT_MIN_RR_SEC)?;
        if !(min_rr_sec.is_finite() && min_rr_sec > 0.0) {
            return Err(StoreError::invalid_param(
                "min_rr_sec",
                format!("must be positive, got {}", min_rr_sec),
            ));
        }

        let (mean, std) = mean_std(samples);
        let threshold = mean + k * std;
        let distance = (min_rr_sec * fs) as usize;

        let mut peaks: Vec<usize> = Vec::new();
        for i in 1..samples.len().saturating_sub(1) {
            let v = samples[i];
            if v > samples[i - 1]
                && v > samples[i + 1]
                && v > threshold
                && peaks.last().map_or(true, |&last| i - last > distance)
            {
                peaks.push(i);
            }
        }
        Ok(Detection::new(self.name(), peaks, Vec::new()))
    }
}

/// Band-pass filter, then [`find_peaks`] with a minimum height of
/// `height_std` standard deviations of the filtered trace. A band the
/// sampling rate cannot carry skips the filter with a warning.
#[derive(Debug, Default)]
pub struct ScipyBasicDetector;

impl PeakDetector for ScipyBasicDetector {
    fn name(&self) -> &str {
        "scipy_basic"
    }

    fn description(&self) -> &str {
        "find_peaks with bandpass filter - simple and reliable"
    }

    fn default_params(&self) -> Params {
        Params::new()
            .with("min_rr_sec", DEFAULT_BANDPASS_MIN_RR_SEC)
            .with("height_std", DEFAULT_HEIGHT_STD)
            .with("filter_signal", true)
            .with("low_cutoff", DEFAULT_LOW_CUTOFF_HZ)
            .with("high_cutoff", DEFAULT_HIGH_CUTOFF_HZ)
    }

    fn signal_types(&self) -> &[&str] {
        CARDIAC_SIGNAL_TYPES
    }

    fn detect(&self, samples: &[f64], fs: f64, params: &Params) -> Result<Detection> {
        let min_rr_sec = params.float_or("min_rr_sec", DEFAULT_BANDPASS_MIN_RR_SEC)?;
        if !(min_rr_sec.is_finite() && min_rr_sec > 0.0) {
            return Err(StoreError::invalid_param(
                "min_rr_sec",
                format!("must be positive, got {}", min_rr_sec),
            ));
        }
        let height_std = params.float_or("height_std", DEFAULT_HEIGHT_STD)?;

        let mut warnings = Vec::new();
        let trace = if params.bool_or("filter_signal", true)? {
            let nyquist = fs / 2.0;
            let low = params
                .float_or("low_cutoff", DEFAULT_LOW_CUTOFF_HZ)?
                .max(0.001 * nyquist);
            let high = params
                .float_or("high_cutoff", DEFAULT_HIGH_CUTOFF_HZ)?
                .min(0.999 * nyquist);
            match SosFilter::butterworth_bandpass(low, high, fs, BANDPASS_ORDER) {
                Ok(filter) => filter.filtfilt(samples),
                Err(e) => {
                    let warning = DetectionWarning::FilterSkipped { reason: e.to_string() };
                    warn!("{}", warning);
                    warnings.push(warning);
                    samples.to_vec()
                }
            }
        } else {
            samples.to_vec()
        };

        let (_, std) = mean_std(&trace);
        let distance = (min_rr_sec * fs) as usize;
        let peaks = find_peaks(&trace, distance, Some(std * height_std));
        debug!("scipy_basic: {} peaks, distance {}", peaks.len(), distance);
        Ok(Detection::new(self.name(), peaks, warnings))
    }
}

/// Resolve a possibly deprecated method name.
pub fn canonical_method(name: &str) -> (&str, Option<DetectionWarning>) {
    match METHOD_ALIASES.iter().find(|(alias, _)| *alias == name) {
        Some(&(alias, canonical)) => (
            canonical,
            Some(DetectionWarning::DeprecatedMethod {
                alias: alias.to_string(),
                canonical: canonical.to_string(),
            }),
        ),
        None => (name, None),
    }
}

/// Rename deprecated parameter keys. A canonical key already present wins
/// over its alias.
pub fn translate_param_aliases(params: &Params, warnings: &mut Vec<DetectionWarning>) -> Params {
    let mut out = params.clone();
    for (alias, canonical) in PARAM_ALIASES {
        if let Some(value) = out.remove(alias) {
            warnings.push(DetectionWarning::DeprecatedParam {
                alias: alias.to_string(),
                canonical: canonical.to_string(),
            });
            if !out.contains(canonical) {
                out.insert(canonical, value);
            }
        }
    }
    if let Some(method) = out.get("method").and_then(ParamValue::as_str) {
        let (canonical, warning) = canonical_method(method);
        if let Some(warning) = warning {
            let canonical = canonical.to_string();
            warnings.push(warning);
            out.insert("method", canonical);
        }
    }
    out
}

/// Registry of detection strategies, addressed by name.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: BTreeMap<String, Arc<dyn PeakDetector>>,
}

impl fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("detectors", &self.list())
            .finish()
    }
}

impl DetectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `dwt`, `swt`, `cwt`, `scipy_basic` and
    /// `threshold` detectors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DwtDetector));
        registry.register(Arc::new(SwtDetector));
        registry.register(Arc::new(CwtDetector::default()));
        registry.register(Arc::new(ScipyBasicDetector));
        registry.register(Arc::new(ThresholdDetector));
        registry
    }

    /// Add or replace a detector under its own name.
    pub fn register(&mut self, detector: Arc<dyn PeakDetector>) {
        self.detectors.insert(detector.name().to_string(), detector);
    }

    pub fn list(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }

    /// Detectors declaring `signal_type` (case-insensitive) or accepting any
    /// signal.
    pub fn for_signal_type(&self, signal_type: &str) -> Vec<String> {
        self.detectors
            .iter()
            .filter(|(_, d)| {
                d.signal_types()
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(signal_type) || *t == GENERIC_SIGNAL_TYPE)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Name to description for every registered detector.
    pub fn info(&self) -> BTreeMap<String, String> {
        self.detectors
            .iter()
            .map(|(name, d)| (name.clone(), d.description().to_string()))
            .collect()
    }

    pub fn get(&self, method: &str) -> Result<&Arc<dyn PeakDetector>> {
        let (canonical, _) = canonical_method(method);
        self.detectors
            .get(canonical)
            .ok_or_else(|| StoreError::UnknownStrategy {
                name: method.to_string(),
                available: self.list(),
            })
    }

    pub fn defaults(&self, method: &str) -> Result<Params> {
        Ok(self.get(method)?.default_params())
    }

    /// Canonical parameter set for a derived-signal request: aliases
    /// translated, `defaults` filled in, numbers stored with the type of the
    /// detector's own defaults and the wavelet name lowercased. Fails with
    /// `UnknownStrategy` before any work if the method is not registered.
    pub fn normalize_params(
        &self,
        params: &Params,
        defaults: &Params,
    ) -> Result<(Params, Vec<DetectionWarning>)> {
        let mut warnings = Vec::new();
        let mut out = translate_param_aliases(params, &mut warnings).with_defaults(defaults);

        let method = out.str_or("method", DEFAULT_HR_METHOD)?.to_string();
        let detector_defaults = self.get(&method)?.default_params();
        out.insert("method", method);

        // every value takes the type of the detector's own default
        let mut types = Params::new()
            .with("level", DEFAULT_LEVEL)
            .with("min_rr_sec", DEFAULT_MIN_RR_SEC);
        for (key, value) in detector_defaults.iter() {
            types.insert(key, value.clone());
        }
        for (key, default) in types.iter() {
            let coerced = match (default, out.get(key)) {
                (_, None) => continue,
                (ParamValue::Int(_), Some(_)) => ParamValue::Int(out.int_or(key, 0)?),
                (ParamValue::Float(_), Some(_)) => ParamValue::Float(out.float_or(key, 0.0)?),
                (ParamValue::Bool(_), Some(_)) => ParamValue::Bool(out.bool_or(key, false)?),
                (_, Some(v)) => v.clone(),
            };
            out.insert(key, coerced);
        }
        let wavelet = out
            .get("wavelet")
            .and_then(ParamValue::as_str)
            .map(|w| w.trim().to_ascii_lowercase());
        if let Some(wavelet) = wavelet {
            out.insert("wavelet", wavelet);
        }

        for w in &warnings {
            warn!("{}", w);
        }
        Ok((out, warnings))
    }

    /// Run `method` on `samples`. Deprecated method and parameter names are
    /// translated and reported in the returned warnings.
    pub fn detect_peaks(
        &self,
        samples: &[f64],
        fs: f64,
        method: &str,
        params: &Params,
    ) -> Result<Detection> {
        if samples.is_empty() {
            return Err(StoreError::InvalidInput("cannot detect peaks in an empty signal".into()));
        }
        if !(fs.is_finite() && fs > 0.0) {
            return Err(StoreError::InvalidInput(format!(
                "sampling rate must be positive, got {}",
                fs
            )));
        }

        let mut warnings = Vec::new();
        let (canonical, method_warning) = canonical_method(method);
        warnings.extend(method_warning);
        let params = translate_param_aliases(params, &mut warnings);
        for w in &warnings {
            warn!("{}", w);
        }

        let detector = self.get(canonical)?;
        let mut detection = detector.detect(samples, fs, &params)?;
        debug!(
            "{} found {} peaks in {} samples",
            detection.method,
            detection.peaks.len(),
            samples.len()
        );

        warnings.append(&mut detection.warnings);
        detection.warnings = warnings;
        Ok(detection)
    }
}
