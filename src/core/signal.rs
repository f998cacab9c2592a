// Signal and annotation value types

use crate::core::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// How a signal's time axis relates to its sample index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timebase {
    /// `time[i] = (i + 1) / sampling_rate_hz`
    Uniform,
    /// Time values are stored pairwise with the samples.
    Explicit,
}

/// One channel's time series. Immutable once built; the store hands these out
/// behind `Arc` so cache hits share a single instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    name: String,
    sampling_rate_hz: f64,
    samples: Vec<f64>,
    time: Vec<f64>,
    units: String,
    timebase: Timebase,
    pre_buffer: Vec<f64>,
    post_buffer: Vec<f64>,
    annotations: Vec<Comment>,
    /// Detected R peaks behind a derived signal, as indices into the source
    /// channel's full series.
    r_peaks: Vec<usize>,
}

impl Signal {
    /// Uniformly sampled signal; the time axis is generated from the rate.
    pub fn uniform(
        name: impl Into<String>,
        samples: Vec<f64>,
        sampling_rate_hz: f64,
        units: impl Into<String>,
    ) -> Result<Self> {
        check_rate(sampling_rate_hz)?;
        let time = (1..=samples.len())
            .map(|i| i as f64 / sampling_rate_hz)
            .collect();
        Ok(Self {
            name: name.into(),
            sampling_rate_hz,
            samples,
            time,
            units: units.into(),
            timebase: Timebase::Uniform,
            pre_buffer: Vec::new(),
            post_buffer: Vec::new(),
            annotations: Vec::new(),
            r_peaks: Vec::new(),
        })
    }

    /// Signal built from explicit time/value pairs.
    pub fn explicit(
        name: impl Into<String>,
        samples: Vec<f64>,
        time: Vec<f64>,
        sampling_rate_hz: f64,
        units: impl Into<String>,
    ) -> Result<Self> {
        check_rate(sampling_rate_hz)?;
        if samples.len() != time.len() {
            return Err(StoreError::InvalidInput(format!(
                "{} samples but {} time values",
                samples.len(),
                time.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            sampling_rate_hz,
            samples,
            time,
            units: units.into(),
            timebase: Timebase::Explicit,
            pre_buffer: Vec::new(),
            post_buffer: Vec::new(),
            annotations: Vec::new(),
            r_peaks: Vec::new(),
        })
    }

    pub fn with_buffers(mut self, pre_buffer: Vec<f64>, post_buffer: Vec<f64>) -> Self {
        self.pre_buffer = pre_buffer;
        self.post_buffer = post_buffer;
        self
    }

    pub fn with_annotations(mut self, annotations: Vec<Comment>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_peaks(mut self, r_peaks: Vec<usize>) -> Self {
        self.r_peaks = r_peaks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs(&self) -> f64 {
        self.sampling_rate_hz
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    pub fn pre_buffer(&self) -> &[f64] {
        &self.pre_buffer
    }

    pub fn post_buffer(&self) -> &[f64] {
        &self.post_buffer
    }

    pub fn annotations(&self) -> &[Comment] {
        &self.annotations
    }

    /// Empty for signals read straight from a file.
    pub fn r_peaks(&self) -> &[usize] {
        &self.r_peaks
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_sec(&self) -> f64 {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    /// Pre-buffer, trimmed samples and post-buffer joined back together.
    pub fn full_series(&self) -> Vec<f64> {
        let mut full =
            Vec::with_capacity(self.pre_buffer.len() + self.samples.len() + self.post_buffer.len());
        full.extend_from_slice(&self.pre_buffer);
        full.extend_from_slice(&self.samples);
        full.extend_from_slice(&self.post_buffer);
        full
    }
}

fn check_rate(fs: f64) -> Result<()> {
    if fs.is_finite() && fs > 0.0 {
        Ok(())
    } else {
        Err(StoreError::InvalidInput(format!(
            "sampling rate must be positive, got {}",
            fs
        )))
    }
}

/// Timestamped text marker in a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub text: String,
    /// Empty for comments that apply to every channel.
    pub channel: String,
    pub time_sec: f64,
    pub tick_position: u64,
    pub tick_duration: f64,
    pub comment_id: u32,
    pub user_defined: bool,
    pub label: String,
}

impl Comment {
    pub fn applies_to(&self, channel: &str) -> bool {
        self.channel.is_empty() || self.channel == channel
    }
}
