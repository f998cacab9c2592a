// Channel readers: the trait the store talks to and the PHX implementation

use crate::core::compression::{bytes_to_samples, decompress};
use crate::core::constants::*;
use crate::core::error::{Result, StoreError};
use crate::core::format::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Source of raw channel data for one opened recording.
///
/// Records are addressed from 0. `get_record_samples` returns `Ok(None)` when a
/// channel has no data for that record.
pub trait ChannelReader: Send {
    fn channels(&self) -> &[ChannelInfo];

    fn record_count(&self) -> usize;

    fn get_record_samples(&self, channel: &str, record: usize) -> Result<Option<Vec<f64>>>;

    fn annotations(&self) -> Result<Vec<AnnotationEntry>>;

    /// Sample count of one record. The default decodes the record; readers
    /// with an index should answer from it.
    fn record_len(&self, channel: &str, record: usize) -> Result<Option<usize>> {
        Ok(self.get_record_samples(channel, record)?.map(|s| s.len()))
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn channel(&self, name: &str) -> Option<&ChannelInfo> {
        self.channels().iter().find(|c| c.name == name)
    }
}

pub struct PhxReader {
    path: PathBuf,
    file: Mutex<File>,
    header: FileHeader,
    index: HashMap<(u16, u32), IndexEntry>,
    annotation_offset: u64,
}

impl PhxReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let header = Self::read_header(&mut file)?;
        let (index_offset, annotation_offset) = Self::read_footer(&mut file)?;
        let index = Self::read_index(&mut file, index_offset)?;

        debug!(
            "Opened {} ({} channels, {} records, {} blocks)",
            path.display(),
            header.channels.len(),
            header.record_count,
            index.len()
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            header,
            index,
            annotation_offset,
        })
    }

    /// Factory form used by the reader registry.
    pub fn open_boxed(path: &Path) -> Result<Box<dyn ChannelReader>> {
        Ok(Box::new(Self::open(path)?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    fn read_header(file: &mut File) -> Result<FileHeader> {
        let mut prefix = [0u8; HEADER_PREFIX_SIZE];
        file.read_exact(&mut prefix)?;

        let magic = &prefix[0..4];
        if magic != MAGIC {
            return Err(StoreError::InvalidMagic {
                expected: MAGIC.to_vec(),
                got: magic.to_vec(),
            });
        }

        let version = prefix[4];
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let compression = prefix[5];
        let created = f64::from_le_bytes(field(&prefix, 6)?);
        let channel_count = u16::from_le_bytes(field(&prefix, 14)?);
        let record_count = u32::from_le_bytes(field(&prefix, 16)?);

        if channel_count == 0 && record_count > 0 {
            return Err(StoreError::CorruptedData(format!(
                "{} records declared without any channel",
                record_count
            )));
        }
        // each channel needs two string lengths plus one rate per record
        let per_channel = 4 + record_count as u64 * 8;
        let channel_count = bounded_count(file, channel_count as u64, per_channel, "channel")?;

        let mut channels = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            let name = read_string(file)?;
            let unit = read_string(file)?;

            let mut rates = Vec::with_capacity(record_count as usize);
            for _ in 0..record_count {
                let mut buf = [0u8; 8];
                file.read_exact(&mut buf)?;
                let fs = f64::from_le_bytes(buf);
                if !(fs.is_finite() && fs > 0.0) {
                    return Err(StoreError::CorruptedData(format!(
                        "channel {} has sampling rate {}",
                        name, fs
                    )));
                }
                rates.push(fs);
            }

            channels.push(ChannelInfo {
                name,
                unit,
                sampling_rate_per_record: rates,
            });
        }

        Ok(FileHeader {
            version,
            compression,
            created,
            record_count,
            channels,
        })
    }

    fn read_footer(file: &mut File) -> Result<(u64, u64)> {
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        let footer_magic = &footer[0..4];
        if footer_magic != FOOTER_MAGIC {
            return Err(StoreError::InvalidMagic {
                expected: FOOTER_MAGIC.to_vec(),
                got: footer_magic.to_vec(),
            });
        }

        let index_offset = u64::from_le_bytes(field(&footer, 4)?);
        let annotation_offset = u64::from_le_bytes(field(&footer, 12)?);
        Ok((index_offset, annotation_offset))
    }

    fn read_index(file: &mut File, index_offset: u64) -> Result<HashMap<(u16, u32), IndexEntry>> {
        file.seek(SeekFrom::Start(index_offset))?;
        expect_magic(file, INDEX_MAGIC)?;

        let mut count_buf = [0u8; 4];
        file.read_exact(&mut count_buf)?;
        let entry_count = u32::from_le_bytes(count_buf);
        let entry_count = bounded_count(file, entry_count as u64, INDEX_ENTRY_SIZE as u64, "index entry")?;

        let mut index = HashMap::with_capacity(entry_count);
        for _ in 0..entry_count {
            let mut entry_buf = [0u8; INDEX_ENTRY_SIZE];
            file.read_exact(&mut entry_buf)?;

            let entry = IndexEntry {
                channel: u16::from_le_bytes(field(&entry_buf, 0)?),
                record: u32::from_le_bytes(field(&entry_buf, 2)?),
                offset: u64::from_le_bytes(field(&entry_buf, 6)?),
                sample_count: u32::from_le_bytes(field(&entry_buf, 14)?),
            };
            index.insert((entry.channel, entry.record), entry);
        }

        Ok(index)
    }

    fn channel_slot(&self, name: &str) -> Option<u16> {
        self.header
            .channels
            .iter()
            .position(|c| c.name == name)
            .map(|i| i as u16)
    }

    fn compression(&self) -> Result<CompressionType> {
        CompressionType::from_u8(self.header.compression)
            .ok_or(StoreError::UnsupportedCompression(self.header.compression))
    }

    fn read_block_at(&self, entry: &IndexEntry) -> Result<Vec<f64>> {
        let compression = self.compression()?;
        let mut file = self.file.lock().map_err(|_| StoreError::LockPoisoned)?;

        file.seek(SeekFrom::Start(entry.offset))?;
        expect_magic(&mut *file, RECORD_MAGIC)?;

        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header_buf)?;

        let header = RecordHeader {
            channel: u16::from_le_bytes(field(&header_buf, 0)?),
            record: u32::from_le_bytes(field(&header_buf, 2)?),
            sample_count: u32::from_le_bytes(field(&header_buf, 6)?),
            raw_length: u32::from_le_bytes(field(&header_buf, 10)?),
            compressed_length: u32::from_le_bytes(field(&header_buf, 14)?),
        };

        if header.channel != entry.channel || header.record != entry.record {
            return Err(StoreError::CorruptedData(format!(
                "index points at block ({}, {}) but found ({}, {})",
                entry.channel, entry.record, header.channel, header.record
            )));
        }

        let compressed_length = bounded_count(&mut *file, header.compressed_length as u64, 1, "payload byte")?;
        let mut compressed_data = vec![0u8; compressed_length];
        file.read_exact(&mut compressed_data)?;
        drop(file);

        let raw_data = decompress(&compressed_data, compression)?;
        if raw_data.len() != header.raw_length as usize
            || raw_data.len() != header.sample_count as usize * SAMPLE_SIZE
        {
            return Err(StoreError::CorruptedData(format!(
                "Expected {} samples ({} bytes), got {} bytes",
                header.sample_count,
                header.raw_length,
                raw_data.len()
            )));
        }

        bytes_to_samples(&raw_data)
    }
}

impl ChannelReader for PhxReader {
    fn channels(&self) -> &[ChannelInfo] {
        &self.header.channels
    }

    fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    fn get_record_samples(&self, channel: &str, record: usize) -> Result<Option<Vec<f64>>> {
        let slot = self
            .channel_slot(channel)
            .ok_or_else(|| StoreError::ChannelNotFound(channel.to_string()))?;

        match self.index.get(&(slot, record as u32)) {
            Some(entry) => self.read_block_at(entry).map(Some),
            None => Ok(None),
        }
    }

    fn annotations(&self) -> Result<Vec<AnnotationEntry>> {
        let mut file = self.file.lock().map_err(|_| StoreError::LockPoisoned)?;
        file.seek(SeekFrom::Start(self.annotation_offset))?;
        expect_magic(&mut *file, ANNOTATION_MAGIC)?;

        let mut count_buf = [0u8; 4];
        file.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf);
        // fixed part plus the text length prefix
        let count = bounded_count(&mut *file, count as u64, ANNOTATION_ENTRY_SIZE as u64 + 2, "annotation")?;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut buf = [0u8; ANNOTATION_ENTRY_SIZE];
            file.read_exact(&mut buf)?;

            let slot = u16::from_le_bytes(field(&buf, 0)?);
            let record = u32::from_le_bytes(field(&buf, 2)?) as usize;
            let tick_position = u64::from_le_bytes(field(&buf, 6)?);
            let tick_dt = f64::from_le_bytes(field(&buf, 14)?);
            let id = u32::from_le_bytes(field(&buf, 22)?);
            let text = read_string(&mut *file)?;

            let channel = if slot == GLOBAL_CHANNEL {
                String::new()
            } else {
                self.header
                    .channels
                    .get(slot as usize)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| {
                        StoreError::CorruptedData(format!("annotation on unknown channel {}", slot))
                    })?
            };

            entries.push(AnnotationEntry {
                text,
                channel,
                record,
                tick_position,
                tick_duration: if tick_dt.is_nan() { None } else { Some(tick_dt) },
                id,
            });
        }

        Ok(entries)
    }

    fn record_len(&self, channel: &str, record: usize) -> Result<Option<usize>> {
        let slot = self
            .channel_slot(channel)
            .ok_or_else(|| StoreError::ChannelNotFound(channel.to_string()))?;
        Ok(self
            .index
            .get(&(slot, record as u32))
            .map(|e| e.sample_count as usize))
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.header.recorded_at()
    }
}

/// `count` entries of at least `entry_size` bytes must fit in what is left of
/// the file after the current position.
fn bounded_count(file: &mut File, count: u64, entry_size: u64, what: &str) -> Result<usize> {
    let left = file.metadata()?.len().saturating_sub(file.stream_position()?);
    if count.saturating_mul(entry_size) > left {
        return Err(StoreError::CorruptedData(format!(
            "{} {} count exceeds the {} bytes left in the file",
            count, what, left
        )));
    }
    Ok(count as usize)
}

fn expect_magic<R: Read>(reader: &mut R, expected: &[u8; 4]) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != expected {
        return Err(StoreError::InvalidMagic {
            expected: expected.to_vec(),
            got: magic.to_vec(),
        });
    }
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf)?;
    let len = u16::from_le_bytes(len_buf) as usize;

    let mut str_buf = vec![0u8; len];
    reader.read_exact(&mut str_buf)?;

    String::from_utf8(str_buf).map_err(|e| e.into())
}

fn field<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N]> {
    buf.get(at..at + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::CorruptedData(format!("truncated field at byte {}", at)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::SignalStore;
    use std::io::Write;

    /// Header with no channel table, an index declaring `index_count`
    /// entries and an annotation table declaring `annotation_count`, none of
    /// which are present.
    fn inflated_file(channels: u16, records: u32, index_count: u32, annotation_count: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[FORMAT_VERSION, CompressionType::None as u8]);
        bytes.extend_from_slice(&0.0f64.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&records.to_le_bytes());

        let index_offset = bytes.len() as u64;
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend_from_slice(&index_count.to_le_bytes());

        let annotation_offset = bytes.len() as u64;
        bytes.extend_from_slice(ANNOTATION_MAGIC);
        bytes.extend_from_slice(&annotation_count.to_le_bytes());

        bytes.extend_from_slice(FOOTER_MAGIC);
        bytes.extend_from_slice(&index_offset.to_le_bytes());
        bytes.extend_from_slice(&annotation_offset.to_le_bytes());
        bytes
    }

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_empty_file_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.phx", &inflated_file(0, 0, 0, 0));
        let reader = PhxReader::open(&path).unwrap();
        assert_eq!(reader.record_count(), 0);
        assert!(reader.annotations().unwrap().is_empty());
    }

    #[test]
    fn test_inflated_index_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "index.phx", &inflated_file(0, 0, u32::MAX, 0));
        assert!(matches!(PhxReader::open(&path), Err(StoreError::CorruptedData(_))));

        let mut store = SignalStore::new();
        assert!(matches!(store.load_file(&path), Err(StoreError::FileLoad { .. })));
        assert!(store.list_loaded_files().is_empty());
    }

    #[test]
    fn test_inflated_record_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "records.phx", &inflated_file(1, u32::MAX, 0, 0));
        assert!(matches!(PhxReader::open(&path), Err(StoreError::CorruptedData(_))));

        let path = write_file(dir.path(), "orphan.phx", &inflated_file(0, u32::MAX, 0, 0));
        assert!(matches!(PhxReader::open(&path), Err(StoreError::CorruptedData(_))));
    }

    #[test]
    fn test_inflated_annotation_count_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "notes.phx", &inflated_file(0, 0, 0, u32::MAX));
        let reader = PhxReader::open(&path).unwrap();
        assert!(matches!(reader.annotations(), Err(StoreError::CorruptedData(_))));

        let mut store = SignalStore::new();
        assert!(matches!(store.load_file(&path), Err(StoreError::FileLoad { .. })));
    }
}
