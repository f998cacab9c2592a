// PHX writer: builds recordings the reader understands

use crate::core::compression::{compress, samples_to_bytes};
use crate::core::constants::*;
use crate::core::error::{Result, StoreError};
use crate::core::format::{ChannelInfo, IndexEntry};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tracing::debug;

struct PendingAnnotation {
    slot: u16,
    record: u32,
    tick_position: u64,
    tick_duration: Option<f64>,
    id: u32,
    text: String,
}

/// In-memory builder for a PHX recording.
///
/// Channels are declared up front; record blocks and annotations can then be
/// added in any order. Nothing touches disk until [`PhxWriter::write_to`].
pub struct PhxWriter {
    compression: CompressionType,
    created: f64,
    record_count: u32,
    channels: Vec<ChannelInfo>,
    blocks: Vec<(u16, u32, Vec<f64>)>,
    annotations: Vec<PendingAnnotation>,
}

impl PhxWriter {
    pub fn new(record_count: u32, compression: CompressionType) -> Self {
        Self {
            compression,
            created: 0.0,
            record_count,
            channels: Vec::new(),
            blocks: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Creation time as seconds since the Unix epoch.
    pub fn created(mut self, unix_secs: f64) -> Self {
        self.created = unix_secs;
        self
    }

    pub fn add_channel(&mut self, name: &str, unit: &str, fs: f64) -> Result<()> {
        if !(fs.is_finite() && fs > 0.0) {
            return Err(StoreError::invalid_param("fs", format!("{} is not a positive rate", fs)));
        }
        if self.channels.iter().any(|c| c.name == name) {
            return Err(StoreError::InvalidInput(format!("duplicate channel {}", name)));
        }
        self.channels
            .push(ChannelInfo::new(name, unit, fs, self.record_count as usize));
        Ok(())
    }

    pub fn add_record(&mut self, channel: &str, record: u32, samples: &[f64]) -> Result<()> {
        let slot = self.slot(channel)?;
        if record >= self.record_count {
            return Err(StoreError::InvalidInput(format!(
                "record {} out of range (recording has {})",
                record, self.record_count
            )));
        }
        self.blocks.push((slot, record, samples.to_vec()));
        Ok(())
    }

    /// Add an annotation. An empty `channel` marks it as global.
    pub fn add_annotation(
        &mut self,
        channel: &str,
        record: u32,
        tick_position: u64,
        tick_duration: Option<f64>,
        id: u32,
        text: &str,
    ) -> Result<()> {
        let slot = if channel.is_empty() {
            GLOBAL_CHANNEL
        } else {
            self.slot(channel)?
        };
        self.annotations.push(PendingAnnotation {
            slot,
            record,
            tick_position,
            tick_duration,
            id,
            text: text.to_string(),
        });
        Ok(())
    }

    fn slot(&self, channel: &str) -> Result<u16> {
        self.channels
            .iter()
            .position(|c| c.name == channel)
            .map(|i| i as u16)
            .ok_or_else(|| StoreError::ChannelNotFound(channel.to_string()))
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut out = BufWriter::new(file);

        // Header
        out.write_all(MAGIC)?;
        out.write_all(&[FORMAT_VERSION, self.compression as u8])?;
        out.write_all(&self.created.to_le_bytes())?;
        out.write_all(&(self.channels.len() as u16).to_le_bytes())?;
        out.write_all(&self.record_count.to_le_bytes())?;
        for channel in &self.channels {
            write_string(&mut out, &channel.name)?;
            write_string(&mut out, &channel.unit)?;
            for fs in &channel.sampling_rate_per_record {
                out.write_all(&fs.to_le_bytes())?;
            }
        }

        // Record blocks
        let mut index = Vec::with_capacity(self.blocks.len());
        for (slot, record, samples) in &self.blocks {
            let offset = out.stream_position()?;
            let raw = samples_to_bytes(samples);
            let payload = compress(&raw, self.compression)?;

            out.write_all(RECORD_MAGIC)?;
            out.write_all(&slot.to_le_bytes())?;
            out.write_all(&record.to_le_bytes())?;
            out.write_all(&(samples.len() as u32).to_le_bytes())?;
            out.write_all(&(raw.len() as u32).to_le_bytes())?;
            out.write_all(&(payload.len() as u32).to_le_bytes())?;
            out.write_all(&payload)?;

            index.push(IndexEntry {
                channel: *slot,
                record: *record,
                offset,
                sample_count: samples.len() as u32,
            });
        }

        // Index
        let index_offset = out.stream_position()?;
        out.write_all(INDEX_MAGIC)?;
        out.write_all(&(index.len() as u32).to_le_bytes())?;
        for entry in &index {
            out.write_all(&entry.channel.to_le_bytes())?;
            out.write_all(&entry.record.to_le_bytes())?;
            out.write_all(&entry.offset.to_le_bytes())?;
            out.write_all(&entry.sample_count.to_le_bytes())?;
        }

        // Annotations
        let annotation_offset = out.stream_position()?;
        out.write_all(ANNOTATION_MAGIC)?;
        out.write_all(&(self.annotations.len() as u32).to_le_bytes())?;
        for a in &self.annotations {
            out.write_all(&a.slot.to_le_bytes())?;
            out.write_all(&a.record.to_le_bytes())?;
            out.write_all(&a.tick_position.to_le_bytes())?;
            out.write_all(&a.tick_duration.unwrap_or(f64::NAN).to_le_bytes())?;
            out.write_all(&a.id.to_le_bytes())?;
            write_string(&mut out, &a.text)?;
        }

        // Footer
        out.write_all(FOOTER_MAGIC)?;
        out.write_all(&index_offset.to_le_bytes())?;
        out.write_all(&annotation_offset.to_le_bytes())?;
        out.flush()?;

        debug!(
            "Wrote recording: {} channels, {} blocks, {} annotations",
            self.channels.len(),
            index.len(),
            self.annotations.len()
        );
        Ok(())
    }
}

fn write_string<W: Write>(out: &mut W, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| StoreError::InvalidInput(format!("string of {} bytes is too long", s.len())))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(s.as_bytes())?;
    Ok(())
}
