// Data structures for the PHX recording format

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub unit: String,
    /// One rate per record; recordings are typically uniform.
    pub sampling_rate_per_record: Vec<f64>,
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, fs: f64, records: usize) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            sampling_rate_per_record: vec![fs; records],
        }
    }

    pub fn record_count(&self) -> usize {
        self.sampling_rate_per_record.len()
    }

    /// Rate of the first record, used as the channel rate.
    pub fn sampling_rate(&self) -> Option<f64> {
        self.sampling_rate_per_record.first().copied()
    }
}

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: u8,
    pub compression: u8,
    pub created: f64,
    pub record_count: u32,
    pub channels: Vec<ChannelInfo>,
}

impl FileHeader {
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        if !self.created.is_finite() || self.created <= 0.0 {
            return None;
        }
        let secs = self.created.trunc() as i64;
        let nanos = (self.created.fract() * 1e9) as u32;
        DateTime::from_timestamp(secs, nanos)
    }
}

#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub channel: u16,
    pub record: u32,
    pub sample_count: u32,
    pub raw_length: u32,
    pub compressed_length: u32,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub channel: u16,
    pub record: u32,
    pub offset: u64,
    pub sample_count: u32,
}

/// Annotation as stored in a recording, before it is placed on the time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub text: String,
    /// Empty when the annotation applies to every channel.
    pub channel: String,
    pub record: usize,
    pub tick_position: u64,
    /// Seconds per tick; `None` means one tick per sample of the record.
    pub tick_duration: Option<f64>,
    pub id: u32,
}
