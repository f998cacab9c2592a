// Signal store: file registry, raw and derived signal caches

use crate::core::config::StoreConfig;
use crate::core::constants::*;
use crate::core::detection::DetectorRegistry;
use crate::core::error::{Result, StoreError};
use crate::core::format::AnnotationEntry;
use crate::core::heart_rate::{derive_heart_rate_with, HrDerivation};
use crate::core::params::{ParamKey, Params};
use crate::core::reader::{ChannelReader, PhxReader};
use crate::core::signal::{Comment, Signal};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Opens a recording and returns its channel reader.
pub type ReaderFactory = Arc<dyn Fn(&Path) -> Result<Box<dyn ChannelReader>> + Send + Sync>;

/// Maps file extensions (lowercase, with leading dot) to reader factories.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    factories: BTreeMap<String, ReaderFactory>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that opens `.phx` recordings.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PHX_EXTENSION, Arc::new(PhxReader::open_boxed));
        registry
    }

    pub fn register(&mut self, extension: &str, factory: ReaderFactory) {
        self.factories.insert(normalize_extension(extension), factory);
    }

    pub fn supported_extensions(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        self.factories.contains_key(&extension_of(path))
    }

    /// Open `path` with the reader registered for its extension.
    pub fn open(&self, path: &Path) -> Result<Box<dyn ChannelReader>> {
        let extension = extension_of(path);
        let factory = self
            .factories
            .get(&extension)
            .ok_or_else(|| StoreError::UnsupportedFormat {
                extension,
                supported: self.supported_extensions(),
            })?;
        factory(path).map_err(|e| StoreError::FileLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

fn normalize_extension(extension: &str) -> String {
    let ext = extension.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(normalize_extension)
        .unwrap_or_default()
}

/// Channel listing and rates of one loaded recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub channels: Vec<String>,
    pub fs: BTreeMap<String, f64>,
    pub n_records: usize,
    pub units: BTreeMap<String, String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl FileMetadata {
    fn from_reader(reader: &dyn ChannelReader) -> Self {
        let mut fs = BTreeMap::new();
        let mut units = BTreeMap::new();
        for info in reader.channels() {
            if let Some(rate) = info.sampling_rate() {
                fs.insert(info.name.clone(), rate);
            }
            units.insert(info.name.clone(), info.unit.clone());
        }
        Self {
            channels: reader.channels().iter().map(|c| c.name.clone()).collect(),
            fs,
            n_records: reader.record_count(),
            units,
            recorded_at: reader.recorded_at(),
        }
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c == name)
    }
}

struct FileEntry {
    reader: Box<dyn ChannelReader>,
    metadata: FileMetadata,
    /// Sorted by `time_sec`.
    comments: Vec<Comment>,
    next_comment_id: u32,
    raw_cache: HashMap<String, Arc<Signal>>,
    derived_cache: HashMap<ParamKey, Arc<Signal>>,
    /// Insertion order of `derived_cache`, oldest first.
    derived_order: VecDeque<ParamKey>,
}

impl FileEntry {
    fn evict_over(&mut self, max: usize, path: &Path) {
        while self.derived_order.len() > max {
            if let Some(old) = self.derived_order.pop_front() {
                self.derived_cache.remove(&old);
                info!("Evicted derived signal [{}] for {}", old, path.display());
            }
        }
    }
}

/// Owner of every loaded recording and its cached signals.
///
/// Raw channels are cached for as long as the file stays loaded. Derived
/// heart-rate signals are cached per canonical parameter set in a bounded
/// FIFO: the oldest inserted configuration is dropped first and cache hits do
/// not change the order.
pub struct SignalStore {
    config: StoreConfig,
    readers: ReaderRegistry,
    detectors: DetectorRegistry,
    files: BTreeMap<PathBuf, FileEntry>,
}

impl Default for SignalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalStore {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            readers: ReaderRegistry::with_defaults(),
            detectors: DetectorRegistry::with_defaults(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_config(config: StoreConfig) -> Result<Self> {
        Self::with_registries(config, ReaderRegistry::with_defaults(), DetectorRegistry::with_defaults())
    }

    pub fn with_registries(
        config: StoreConfig,
        readers: ReaderRegistry,
        detectors: DetectorRegistry,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            readers,
            detectors,
            files: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn detector_registry(&self) -> &DetectorRegistry {
        &self.detectors
    }

    pub fn detector_registry_mut(&mut self) -> &mut DetectorRegistry {
        &mut self.detectors
    }

    pub fn reader_registry_mut(&mut self) -> &mut ReaderRegistry {
        &mut self.readers
    }

    /// Change the derived cache bound; queues already over it are trimmed
    /// oldest first.
    pub fn set_derived_cache_size(&mut self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(StoreError::InvalidConfig(
                "derived cache size must be at least 1".into(),
            ));
        }
        self.config.hr_generation.max_cache_size = max;
        for (path, entry) in self.files.iter_mut() {
            entry.evict_over(max, path);
        }
        Ok(())
    }

    /// Open `path` and index its metadata and annotations. A path that is
    /// already loaded is left untouched.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if self.files.contains_key(path) {
            debug!("{} already loaded", path.display());
            return Ok(());
        }

        let reader = self.readers.open(path)?;
        let metadata = FileMetadata::from_reader(reader.as_ref());
        let comments = read_comments(reader.as_ref(), &metadata).map_err(|e| StoreError::FileLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let next_comment_id = comments
            .iter()
            .map(|c| c.comment_id.saturating_add(1))
            .max()
            .unwrap_or(0)
            .max(FIRST_USER_COMMENT_ID);

        info!(
            "Loaded {}: {} channels, {} records, {} comments",
            path.display(),
            metadata.channels.len(),
            metadata.n_records,
            comments.len()
        );

        self.files.insert(
            path.to_path_buf(),
            FileEntry {
                reader,
                metadata,
                comments,
                next_comment_id,
                raw_cache: HashMap::new(),
                derived_cache: HashMap::new(),
                derived_order: VecDeque::new(),
            },
        );
        Ok(())
    }

    pub fn unload_file<P: AsRef<Path>>(&mut self, path: P) {
        if self.files.remove(path.as_ref()).is_some() {
            info!("Unloaded {}", path.as_ref().display());
        }
    }

    pub fn clear_all(&mut self) {
        let count = self.files.len();
        self.files.clear();
        info!("Cleared {} loaded files", count);
    }

    pub fn list_loaded_files(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    pub fn is_loaded<P: AsRef<Path>>(&self, path: P) -> bool {
        self.files.contains_key(path.as_ref())
    }

    fn entry(&self, path: &Path) -> Result<&FileEntry> {
        self.files
            .get(path)
            .ok_or_else(|| StoreError::FileNotLoaded(path.display().to_string()))
    }

    fn entry_mut(&mut self, path: &Path) -> Result<&mut FileEntry> {
        self.files
            .get_mut(path)
            .ok_or_else(|| StoreError::FileNotLoaded(path.display().to_string()))
    }

    /// Signal for `channel` of a loaded file.
    ///
    /// `params` only matter for the derived heart-rate channel (`HR_gen`,
    /// matched case-insensitively); omitted keys take the configured defaults.
    pub fn get_trace<P: AsRef<Path>>(
        &mut self,
        path: P,
        channel: &str,
        params: &Params,
    ) -> Result<Arc<Signal>> {
        let path = path.as_ref();
        let entry = self.entry(path)?;

        if is_derived_channel(channel) {
            return self.derived_trace(path, params);
        }
        if entry.reader.channel(channel).is_none() {
            return Err(StoreError::ChannelNotFound(channel.to_string()));
        }
        self.raw_trace(path, channel)
    }

    fn raw_trace(&mut self, path: &Path, channel: &str) -> Result<Arc<Signal>> {
        let loading = &self.config.loading;
        let entry = self
            .files
            .get_mut(path)
            .ok_or_else(|| StoreError::FileNotLoaded(path.display().to_string()))?;

        if let Some(signal) = entry.raw_cache.get(channel) {
            debug!("Raw cache hit: {} in {}", channel, path.display());
            return Ok(Arc::clone(signal));
        }

        let signal = Arc::new(assemble_raw(entry, channel, loading.gap_sec, loading.boundary_buffer_sec)?);
        entry.raw_cache.insert(channel.to_string(), Arc::clone(&signal));
        debug!(
            "Raw cache miss: {} in {} ({} samples)",
            channel,
            path.display(),
            signal.len()
        );
        Ok(signal)
    }

    fn derived_trace(&mut self, path: &Path, params: &Params) -> Result<Arc<Signal>> {
        let defaults = self.config.hr_generation.default_params();
        let (params, _) = self.detectors.normalize_params(params, &defaults)?;
        let key = ParamKey::from_normalized(params);

        let entry = self.entry(path)?;
        if let Some(signal) = entry.derived_cache.get(&key) {
            debug!("Derived cache hit [{}] for {}", key, path.display());
            return Ok(Arc::clone(signal));
        }

        let ecg_channel = self.config.loading.ecg_channel.clone();
        if entry.reader.channel(&ecg_channel).is_none() {
            return Err(StoreError::ChannelNotFound(ecg_channel));
        }

        // Everything up to the cache insert may fail without leaving a trace.
        let ecg = self.raw_trace(path, &ecg_channel)?;
        let full = ecg.full_series();
        let fs = ecg.fs();
        let method = key.params().str_or("method", DEFAULT_HR_METHOD)?;
        let detection = self.detectors.detect_peaks(&full, fs, method, key.params())?;

        let options = HrDerivation {
            // peak indices count from the start of the pre-buffer
            time_offset: (1.0 - ecg.pre_buffer().len() as f64) / fs,
            min_bpm: self.config.hr_generation.min_hr_bpm,
            max_bpm: self.config.hr_generation.max_hr_bpm,
        };
        let hr = Arc::new(
            derive_heart_rate_with(&detection.peaks, fs, &options)?.with_peaks(detection.peaks.clone()),
        );

        let max = self.config.hr_generation.max_cache_size;
        let entry = self.entry_mut(path)?;
        entry.derived_cache.insert(key.clone(), Arc::clone(&hr));
        entry.derived_order.push_back(key.clone());
        entry.evict_over(max, path);

        if !entry.metadata.channels.iter().any(|c| is_derived_channel(c)) {
            entry.metadata.channels.push(DERIVED_HR_CHANNEL.to_string());
            entry.metadata.fs.insert(DERIVED_HR_CHANNEL.to_string(), hr.fs());
            entry
                .metadata
                .units
                .insert(DERIVED_HR_CHANNEL.to_string(), HR_UNITS.to_string());
        }

        info!(
            "Derived {} with [{}] for {}: {} peaks via {}",
            DERIVED_HR_CHANNEL,
            key,
            path.display(),
            detection.peaks.len(),
            detection.method
        );
        Ok(hr)
    }

    pub fn get_metadata<P: AsRef<Path>>(&self, path: P) -> Result<&FileMetadata> {
        Ok(&self.entry(path.as_ref())?.metadata)
    }

    /// File-native channels plus the derived heart-rate channel whenever the
    /// ECG channel exists, computed or not.
    pub fn get_available_channels<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>> {
        let entry = self.entry(path.as_ref())?;
        let mut channels = entry.metadata.channels.clone();
        if entry.metadata.has_channel(&self.config.loading.ecg_channel)
            && !channels.iter().any(|c| is_derived_channel(c))
        {
            channels.push(DERIVED_HR_CHANNEL.to_string());
        }
        Ok(channels)
    }

    /// Native channels plus one descriptive name per cached heart-rate
    /// configuration, oldest first, e.g. `HR_gen_haar_lv4_rr0.6`.
    pub fn get_available_channels_for_export<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>> {
        let entry = self.entry(path.as_ref())?;
        let mut channels: Vec<String> = entry
            .metadata
            .channels
            .iter()
            .filter(|c| !is_derived_channel(c))
            .cloned()
            .collect();

        if entry.metadata.has_channel(&self.config.loading.ecg_channel) {
            if entry.derived_order.is_empty() {
                channels.push(DERIVED_HR_CHANNEL.to_string());
            } else {
                let hr = &self.config.hr_generation;
                for key in &entry.derived_order {
                    let p = key.params();
                    channels.push(format!(
                        "{}_{}_lv{}_rr{}",
                        DERIVED_HR_CHANNEL,
                        p.str_or("wavelet", &hr.wavelet)?,
                        p.int_or("level", hr.level)?,
                        p.float_or("min_rr_sec", hr.min_rr_sec)?
                    ));
                }
            }
        }
        Ok(channels)
    }

    /// Cached heart-rate configurations in eviction order, oldest first.
    pub fn cached_derived_keys<P: AsRef<Path>>(&self, path: P) -> Result<Vec<ParamKey>> {
        Ok(self.entry(path.as_ref())?.derived_order.iter().cloned().collect())
    }

    pub fn get_comments<P: AsRef<Path>>(&self, path: P) -> Result<&[Comment]> {
        Ok(&self.entry(path.as_ref())?.comments)
    }

    /// Comments with `start_sec <= time_sec <= end_sec`.
    pub fn get_comments_in_range<P: AsRef<Path>>(
        &self,
        path: P,
        start_sec: f64,
        end_sec: f64,
    ) -> Result<&[Comment]> {
        let comments = &self.entry(path.as_ref())?.comments;
        let lo = comments.partition_point(|c| c.time_sec < start_sec);
        let hi = comments.partition_point(|c| c.time_sec <= end_sec).max(lo);
        Ok(&comments[lo..hi])
    }

    /// Add a user comment and return its id. An empty `channel` makes it
    /// global. Cached signals keep the annotations they were built with.
    pub fn add_user_comment<P: AsRef<Path>>(
        &mut self,
        path: P,
        text: &str,
        time_sec: f64,
        channel: &str,
    ) -> Result<u32> {
        if !time_sec.is_finite() {
            return Err(StoreError::InvalidInput(format!("comment time {} is not finite", time_sec)));
        }
        let entry = self.entry_mut(path.as_ref())?;
        if !channel.is_empty() && !entry.metadata.has_channel(channel) {
            return Err(StoreError::ChannelNotFound(channel.to_string()));
        }

        let rate = if channel.is_empty() {
            entry.metadata.fs.values().next().copied()
        } else {
            entry.metadata.fs.get(channel).copied()
        };
        let tick_duration = 1.0 / rate.unwrap_or(1.0);

        let id = entry.next_comment_id;
        entry.next_comment_id += 1;
        let comment = Comment {
            text: text.to_string(),
            channel: channel.to_string(),
            time_sec,
            tick_position: (time_sec.max(0.0) / tick_duration).round() as u64,
            tick_duration,
            comment_id: id,
            user_defined: true,
            label: text.to_string(),
        };
        let at = entry.comments.partition_point(|c| c.time_sec <= time_sec);
        entry.comments.insert(at, comment);
        debug!("Added comment {} at {:.3}s", id, time_sec);
        Ok(id)
    }

    /// Replaces a comment's text and label; the label follows the text when
    /// `label` is `None`. A new `time_sec` moves the comment to its place in
    /// time order, after comments at the same time.
    pub fn update_comment<P: AsRef<Path>>(
        &mut self,
        path: P,
        comment_id: u32,
        text: &str,
        time_sec: Option<f64>,
        label: Option<&str>,
    ) -> Result<()> {
        if let Some(t) = time_sec.filter(|t| !t.is_finite()) {
            return Err(StoreError::InvalidInput(format!("comment time {} is not finite", t)));
        }
        let entry = self.entry_mut(path.as_ref())?;
        let mut at = entry
            .comments
            .iter()
            .position(|c| c.comment_id == comment_id)
            .ok_or(StoreError::CommentNotFound(comment_id))?;

        let mut comment = entry.comments.remove(at);
        comment.text = text.to_string();
        comment.label = label.unwrap_or(text).to_string();
        if let Some(t) = time_sec {
            comment.time_sec = t;
            if comment.tick_duration > 0.0 {
                comment.tick_position = (t.max(0.0) / comment.tick_duration).round() as u64;
            }
            at = entry.comments.partition_point(|c| c.time_sec <= t);
        }
        entry.comments.insert(at, comment);
        debug!("Updated comment {} at position {}", comment_id, at);
        Ok(())
    }

    pub fn remove_comment<P: AsRef<Path>>(&mut self, path: P, comment_id: u32) -> Result<Comment> {
        let entry = self.entry_mut(path.as_ref())?;
        let at = entry
            .comments
            .iter()
            .position(|c| c.comment_id == comment_id)
            .ok_or(StoreError::CommentNotFound(comment_id))?;
        Ok(entry.comments.remove(at))
    }
}

fn is_derived_channel(name: &str) -> bool {
    name.eq_ignore_ascii_case(DERIVED_HR_CHANNEL)
}

/// Concatenate a channel's records with zero gaps between them and split off
/// the boundary buffers.
fn assemble_raw(entry: &FileEntry, channel: &str, gap_sec: f64, buffer_sec: f64) -> Result<Signal> {
    let reader = entry.reader.as_ref();
    let info = reader
        .channel(channel)
        .ok_or_else(|| StoreError::ChannelNotFound(channel.to_string()))?;
    let fs = info
        .sampling_rate()
        .ok_or_else(|| StoreError::CorruptedData(format!("channel {} has no sampling rate", channel)))?;
    let unit = info.unit.clone();

    let gap = (gap_sec * fs).round() as usize;
    let mut full: Vec<f64> = Vec::new();
    for record in 0..reader.record_count() {
        if let Some(samples) = reader.get_record_samples(channel, record)? {
            if !full.is_empty() && gap > 0 {
                full.resize(full.len() + gap, 0.0);
            }
            full.extend_from_slice(&samples);
        }
    }

    let buffer = ((buffer_sec * fs).round() as usize).min(full.len() / 2);
    let post = full.split_off(full.len() - buffer);
    let main = full.split_off(buffer);
    let pre = full;

    let annotations = entry
        .comments
        .iter()
        .filter(|c| c.applies_to(channel))
        .cloned()
        .collect();

    Ok(Signal::uniform(channel, main, fs, unit)?
        .with_buffers(pre, post)
        .with_annotations(annotations))
}

/// Place every annotation on the recording's time axis. A record starts where
/// the previous records of the same channel end.
fn read_comments(reader: &dyn ChannelReader, metadata: &FileMetadata) -> Result<Vec<Comment>> {
    let entries = reader.annotations()?;
    let mut record_starts: HashMap<String, Vec<f64>> = HashMap::new();
    let mut comments = Vec::with_capacity(entries.len());

    for AnnotationEntry {
        text,
        channel,
        record,
        tick_position,
        tick_duration,
        id,
    } in entries
    {
        let timing_channel = if channel.is_empty() {
            metadata.channels.first().cloned()
        } else {
            Some(channel.clone())
        };

        let (fs, offset) = match timing_channel {
            Some(name) => {
                if !record_starts.contains_key(&name) {
                    record_starts.insert(name.clone(), record_offsets(reader, &name)?);
                }
                let fs = reader
                    .channel(&name)
                    .and_then(|c| c.sampling_rate_per_record.get(record).copied())
                    .unwrap_or(1.0);
                let offset = record_starts
                    .get(&name)
                    .and_then(|starts| starts.get(record).copied())
                    .unwrap_or(0.0);
                (fs, offset)
            }
            None => (1.0, 0.0),
        };

        let tick_duration = tick_duration.unwrap_or(1.0 / fs);
        comments.push(Comment {
            label: text.clone(),
            text,
            channel,
            time_sec: tick_position as f64 * tick_duration + offset,
            tick_position,
            tick_duration,
            comment_id: id,
            user_defined: false,
        });
    }

    comments.sort_by(|a, b| a.time_sec.total_cmp(&b.time_sec));
    Ok(comments)
}

fn record_offsets(reader: &dyn ChannelReader, channel: &str) -> Result<Vec<f64>> {
    let info = reader
        .channel(channel)
        .ok_or_else(|| StoreError::ChannelNotFound(channel.to_string()))?;
    let mut starts = Vec::with_capacity(reader.record_count());
    let mut t = 0.0;
    for record in 0..reader.record_count() {
        starts.push(t);
        let fs = info.sampling_rate_per_record.get(record).copied().unwrap_or(1.0);
        let len = reader.record_len(channel, record)?.unwrap_or(0);
        t += len as f64 / fs;
    }
    Ok(starts)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::detection::{Detection, PeakDetector};
    use crate::core::format::ChannelInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory reader that counts opens and record reads.
    #[derive(Clone)]
    pub(crate) struct MockReader {
        channels: Vec<ChannelInfo>,
        records: HashMap<(String, usize), Vec<f64>>,
        annotations: Vec<AnnotationEntry>,
        reads: Arc<AtomicUsize>,
    }

    impl ChannelReader for MockReader {
        fn channels(&self) -> &[ChannelInfo] {
            &self.channels
        }

        fn record_count(&self) -> usize {
            self.channels.first().map_or(0, |c| c.record_count())
        }

        fn get_record_samples(&self, channel: &str, record: usize) -> Result<Option<Vec<f64>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.channel(channel).is_none() {
                return Err(StoreError::ChannelNotFound(channel.to_string()));
            }
            Ok(self.records.get(&(channel.to_string(), record)).cloned())
        }

        fn annotations(&self) -> Result<Vec<AnnotationEntry>> {
            Ok(self.annotations.clone())
        }
    }

    pub(crate) struct Fixture {
        pub store: SignalStore,
        pub opens: Arc<AtomicUsize>,
        pub reads: Arc<AtomicUsize>,
    }

    pub(crate) const ECG_FS: f64 = 100.0;

    /// One 1000-sample ECG record with unit spikes every 0.8 s starting at
    /// sample 40, and a two-record pressure channel.
    pub(crate) fn spike_ecg() -> Vec<f64> {
        let mut ecg = vec![0.0; 1000];
        for i in 0..12 {
            ecg[40 + 80 * i] = 1.0;
        }
        ecg
    }

    pub(crate) fn fixture(config: StoreConfig) -> Fixture {
        let reads = Arc::new(AtomicUsize::new(0));
        let opens = Arc::new(AtomicUsize::new(0));

        let mut records = HashMap::new();
        records.insert(("ECG".to_string(), 0), spike_ecg());
        records.insert(("FBP".to_string(), 0), vec![1.0; 300]);
        records.insert(("FBP".to_string(), 1), vec![2.0; 300]);

        let template = MockReader {
            channels: vec![
                ChannelInfo::new("ECG", "mV", ECG_FS, 2),
                ChannelInfo::new("FBP", "mmHg", 100.0, 2),
            ],
            records,
            annotations: vec![
                AnnotationEntry {
                    text: "cuff".into(),
                    channel: "FBP".into(),
                    record: 1,
                    tick_position: 50,
                    tick_duration: None,
                    id: 2,
                },
                AnnotationEntry {
                    text: "start".into(),
                    channel: String::new(),
                    record: 0,
                    tick_position: 10,
                    tick_duration: Some(0.01),
                    id: 1,
                },
            ],
            reads: Arc::clone(&reads),
        };

        let counter = Arc::clone(&opens);
        let mut readers = ReaderRegistry::with_defaults();
        readers.register(
            "mock",
            Arc::new(move |_: &Path| -> Result<Box<dyn ChannelReader>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(template.clone()))
            }),
        );
        readers.register(
            ".broken",
            Arc::new(|_: &Path| -> Result<Box<dyn ChannelReader>> {
                Err(StoreError::CorruptedData("bad header".into()))
            }),
        );

        let store = SignalStore::with_registries(config, readers, DetectorRegistry::with_defaults()).unwrap();
        Fixture { store, opens, reads }
    }

    fn loaded(config: StoreConfig) -> Fixture {
        let mut fx = fixture(config);
        fx.store.load_file("rec.mock").unwrap();
        fx
    }

    fn hr(level: i64) -> Params {
        Params::new().with("wavelet", "haar").with("level", level)
    }

    #[test]
    fn test_load_is_idempotent() {
        let mut fx = fixture(StoreConfig::default());
        fx.store.load_file("rec.mock").unwrap();
        let reads = fx.reads.load(Ordering::SeqCst);
        fx.store.load_file("rec.mock").unwrap();

        assert_eq!(fx.opens.load(Ordering::SeqCst), 1);
        assert_eq!(fx.reads.load(Ordering::SeqCst), reads);
        assert_eq!(fx.store.list_loaded_files(), vec![PathBuf::from("rec.mock")]);
    }

    #[test]
    fn test_unsupported_format_leaves_store_unchanged() {
        let mut fx = loaded(StoreConfig::default());
        match fx.store.load_file("x.unknownext") {
            Err(StoreError::UnsupportedFormat { extension, supported }) => {
                assert_eq!(extension, ".unknownext");
                assert!(supported.contains(&".phx".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.store.list_loaded_files(), vec![PathBuf::from("rec.mock")]);
    }

    #[test]
    fn test_reader_failure_is_file_load_error() {
        let mut fx = fixture(StoreConfig::default());
        assert!(matches!(
            fx.store.load_file("rec.broken"),
            Err(StoreError::FileLoad { .. })
        ));
        assert!(fx.store.list_loaded_files().is_empty());
    }

    #[test]
    fn test_raw_trace_concatenates_and_buffers() {
        let mut fx = loaded(StoreConfig::default());
        let fbp = fx.store.get_trace("rec.mock", "FBP", &Params::new()).unwrap();

        // 300 + 300 gap + 300 samples, 100 trimmed from each end
        assert_eq!(fbp.len(), 700);
        assert_eq!(fbp.pre_buffer(), &[1.0; 100][..]);
        assert_eq!(fbp.post_buffer(), &[2.0; 100][..]);
        assert_eq!(fbp.samples()[199], 1.0);
        assert_eq!(fbp.samples()[200], 0.0);
        assert_eq!(fbp.samples()[499], 0.0);
        assert_eq!(fbp.samples()[500], 2.0);
        assert_eq!(fbp.time()[0], 0.01);
        assert_eq!(fbp.units(), "mmHg");
        assert_eq!(fbp.full_series().len(), 900);

        let labels: Vec<&str> = fbp.annotations().iter().map(|c| c.text.as_str()).collect();
        assert_eq!(labels, vec!["start", "cuff"]);

        let again = fx.store.get_trace("rec.mock", "FBP", &Params::new()).unwrap();
        assert!(Arc::ptr_eq(&fbp, &again));
    }

    #[test]
    fn test_unknown_channel_and_file() {
        let mut fx = loaded(StoreConfig::default());
        assert!(matches!(
            fx.store.get_trace("rec.mock", "SpO2", &Params::new()),
            Err(StoreError::ChannelNotFound(_))
        ));
        assert!(matches!(
            fx.store.get_trace("other.mock", "ECG", &Params::new()),
            Err(StoreError::FileNotLoaded(_))
        ));
    }

    #[test]
    fn test_derived_cache_identity() {
        let mut fx = loaded(StoreConfig::default());
        let params = Params::new()
            .with("wavelet", "haar")
            .with("level", 4)
            .with("min_rr_sec", 0.6);
        let a = fx.store.get_trace("rec.mock", "HR_gen", &params).unwrap();
        let b = fx.store.get_trace("rec.mock", "hr_gen", &params).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // omitted parameters equal the defaults
        let c = fx.store.get_trace("rec.mock", "HR_gen", &Params::new()).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(fx.store.cached_derived_keys("rec.mock").unwrap().len(), 1);
    }

    #[test]
    fn test_param_key_canonicalization() {
        let mut fx = loaded(StoreConfig::default());
        let a = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("level", 4).with("wavelet", "haar"))
            .unwrap();
        let b = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("wavelet", "haar").with("level", 4))
            .unwrap();
        let c = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("swt_level", 4).with("min_distance_sec", 0.6))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_param_key_ignores_numeric_type_and_wavelet_case() {
        let mut fx = loaded(StoreConfig::default());
        let a = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("height_std", 1))
            .unwrap();
        let b = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("height_std", 1.0))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("wavelet", "HAAR"))
            .unwrap();
        let d = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("wavelet", "haar"))
            .unwrap();
        assert!(Arc::ptr_eq(&c, &d));
        assert_eq!(fx.store.cached_derived_keys("rec.mock").unwrap().len(), 2);
    }

    #[test]
    fn test_derived_signal_values_and_alignment() {
        let mut fx = loaded(StoreConfig::default());
        let hr = fx.store.get_trace("rec.mock", "HR_gen", &Params::new()).unwrap();
        let ecg = fx.store.get_trace("rec.mock", "ECG", &Params::new()).unwrap();

        assert_eq!(hr.name(), "HR");
        assert_eq!(hr.units(), "bpm");
        assert_eq!(hr.len(), 880);
        assert!(hr.samples().iter().all(|v| (v - 75.0).abs() < 1e-9));

        // first peak sits at full-series index 40, main index -60
        let pre = ecg.pre_buffer().len() as f64;
        assert!((hr.time()[0] - (40.0 - pre + 1.0) / ECG_FS).abs() < 1e-9);
        // the spike at full index 120 is main index 20, time 0.21
        assert!((hr.time()[80] - ecg.time()[20]).abs() < 1e-9);

        // peaks stay on the ECG full-series axis
        let expected: Vec<usize> = (0..12).map(|i| 40 + 80 * i).collect();
        assert_eq!(hr.r_peaks(), expected.as_slice());
        let full = ecg.full_series();
        assert!(hr.r_peaks().iter().all(|&p| full[p] == 1.0));
        assert!(ecg.r_peaks().is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut config = StoreConfig::default();
        config.hr_generation.max_cache_size = 2;
        let mut fx = loaded(config);

        let a = fx.store.get_trace("rec.mock", "HR_gen", &hr(2)).unwrap();
        let b = fx.store.get_trace("rec.mock", "HR_gen", &hr(3)).unwrap();
        // a hit on B does not refresh its position
        let b_hit = fx.store.get_trace("rec.mock", "HR_gen", &hr(3)).unwrap();
        assert!(Arc::ptr_eq(&b, &b_hit));
        let c = fx.store.get_trace("rec.mock", "HR_gen", &hr(4)).unwrap();

        let levels = |fx: &Fixture| -> Vec<i64> {
            fx.store
                .cached_derived_keys("rec.mock")
                .unwrap()
                .iter()
                .map(|k| k.params().int_or("level", 0).unwrap())
                .collect()
        };
        assert_eq!(levels(&fx), vec![3, 4]);

        let a2 = fx.store.get_trace("rec.mock", "HR_gen", &hr(2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &a2));
        assert_eq!(levels(&fx), vec![4, 2]);

        let c2 = fx.store.get_trace("rec.mock", "HR_gen", &hr(4)).unwrap();
        assert!(Arc::ptr_eq(&c, &c2));
        let b2 = fx.store.get_trace("rec.mock", "HR_gen", &hr(3)).unwrap();
        assert!(!Arc::ptr_eq(&b, &b2));
    }

    #[test]
    fn test_shrinking_cache_trims_oldest() {
        let mut fx = loaded(StoreConfig::default());
        for level in 1..=3 {
            fx.store.get_trace("rec.mock", "HR_gen", &hr(level)).unwrap();
        }
        fx.store.set_derived_cache_size(1).unwrap();
        let keys = fx.store.cached_derived_keys("rec.mock").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].params().int_or("level", 0).unwrap(), 3);
        assert!(fx.store.set_derived_cache_size(0).is_err());
    }

    struct BrokenDetector;

    impl PeakDetector for BrokenDetector {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn default_params(&self) -> Params {
            Params::new()
        }
        fn detect(&self, _: &[f64], _: f64, _: &Params) -> Result<Detection> {
            Err(StoreError::DetectionFailure {
                method: "broken".into(),
                reason: "numerical error".into(),
            })
        }
    }

    #[test]
    fn test_failed_derivation_leaves_no_trace() {
        let mut fx = loaded(StoreConfig::default());
        fx.store.get_trace("rec.mock", "HR_gen", &hr(4)).unwrap();
        fx.store.detector_registry_mut().register(Arc::new(BrokenDetector));

        let metadata_before = fx.store.get_metadata("rec.mock").unwrap().clone();
        let keys_before = fx.store.cached_derived_keys("rec.mock").unwrap();

        assert!(matches!(
            fx.store.get_trace("rec.mock", "HR_gen", &Params::new().with("method", "broken")),
            Err(StoreError::DetectionFailure { .. })
        ));
        assert!(matches!(
            fx.store.get_trace("rec.mock", "HR_gen", &Params::new().with("method", "nope")),
            Err(StoreError::UnknownStrategy { .. })
        ));
        assert!(matches!(
            fx.store.get_trace("rec.mock", "HR_gen", &Params::new().with("wavelet", "coif9")),
            Err(StoreError::UnsupportedWavelet(_))
        ));

        assert_eq!(fx.store.cached_derived_keys("rec.mock").unwrap(), keys_before);
        assert_eq!(fx.store.get_metadata("rec.mock").unwrap(), &metadata_before);

        // the store keeps working
        assert!(fx.store.get_trace("rec.mock", "HR_gen", &hr(3)).is_ok());
    }

    #[test]
    fn test_failed_first_derivation_does_not_touch_metadata() {
        let mut fx = loaded(StoreConfig::default());
        let _ = fx
            .store
            .get_trace("rec.mock", "HR_gen", &Params::new().with("wavelet", "coif9"));
        assert!(!fx.store.get_metadata("rec.mock").unwrap().has_channel("HR_gen"));
        assert!(fx.store.cached_derived_keys("rec.mock").unwrap().is_empty());
    }

    #[test]
    fn test_available_channels() {
        let mut fx = loaded(StoreConfig::default());
        assert_eq!(
            fx.store.get_available_channels("rec.mock").unwrap(),
            vec!["ECG", "FBP", "HR_gen"]
        );
        assert!(!fx.store.get_metadata("rec.mock").unwrap().has_channel("HR_gen"));
        assert_eq!(
            fx.store.get_available_channels_for_export("rec.mock").unwrap(),
            vec!["ECG", "FBP", "HR_gen"]
        );

        fx.store.get_trace("rec.mock", "HR_gen", &hr(2)).unwrap();
        fx.store.get_trace("rec.mock", "HR_gen", &hr(4)).unwrap();

        let metadata = fx.store.get_metadata("rec.mock").unwrap();
        assert_eq!(metadata.channels, vec!["ECG", "FBP", "HR_gen"]);
        assert_eq!(metadata.fs["HR_gen"], 1.0);
        assert_eq!(
            fx.store.get_available_channels("rec.mock").unwrap(),
            vec!["ECG", "FBP", "HR_gen"]
        );
        assert_eq!(
            fx.store.get_available_channels_for_export("rec.mock").unwrap(),
            vec!["ECG", "FBP", "HR_gen_haar_lv2_rr0.6", "HR_gen_haar_lv4_rr0.6"]
        );
    }

    #[test]
    fn test_missing_ecg_channel() {
        let mut config = StoreConfig::default();
        config.loading.ecg_channel = "EKG".into();
        let mut fx = loaded(config);
        assert_eq!(fx.store.get_available_channels("rec.mock").unwrap(), vec!["ECG", "FBP"]);
        assert!(matches!(
            fx.store.get_trace("rec.mock", "HR_gen", &Params::new()),
            Err(StoreError::ChannelNotFound(name)) if name == "EKG"
        ));
    }

    #[test]
    fn test_comments_placed_on_time_axis() {
        let fx = loaded(StoreConfig::default());
        let comments = fx.store.get_comments("rec.mock").unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "start");
        assert!((comments[0].time_sec - 0.1).abs() < 1e-12);
        // record 1 of FBP starts after 300 samples at 100 Hz
        assert_eq!(comments[1].text, "cuff");
        assert!((comments[1].time_sec - 3.5).abs() < 1e-12);
        assert_eq!(comments[1].tick_duration, 0.01);
        assert!(!comments[1].user_defined);
    }

    #[test]
    fn test_comment_crud() {
        let mut fx = loaded(StoreConfig::default());
        let id = fx.store.add_user_comment("rec.mock", "ectopic", 2.0, "ECG").unwrap();
        assert_eq!(id, FIRST_USER_COMMENT_ID);
        let second = fx.store.add_user_comment("rec.mock", "note", 5.0, "").unwrap();
        assert_eq!(second, FIRST_USER_COMMENT_ID + 1);

        let in_range = fx.store.get_comments_in_range("rec.mock", 1.0, 4.0).unwrap();
        let texts: Vec<&str> = in_range.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["ectopic", "cuff"]);
        assert_eq!(in_range[0].tick_position, 200);
        assert!(in_range[0].user_defined);

        fx.store.update_comment("rec.mock", id, "PVC", None, None).unwrap();
        assert_eq!(fx.store.get_comments("rec.mock").unwrap()[1].label, "PVC");

        let removed = fx.store.remove_comment("rec.mock", id).unwrap();
        assert_eq!(removed.text, "PVC");
        assert_eq!(fx.store.get_comments("rec.mock").unwrap().len(), 3);
        assert!(matches!(
            fx.store.remove_comment("rec.mock", id),
            Err(StoreError::CommentNotFound(_))
        ));
        assert!(matches!(
            fx.store.add_user_comment("rec.mock", "x", 1.0, "SpO2"),
            Err(StoreError::ChannelNotFound(_))
        ));
        assert!(fx.store.get_comments_in_range("rec.mock", 9.0, 1.0).unwrap().is_empty());
    }

    #[test]
    fn test_update_comment_time_and_label() {
        let mut fx = loaded(StoreConfig::default());
        let id = fx.store.add_user_comment("rec.mock", "ectopic", 2.0, "ECG").unwrap();
        let texts = |store: &SignalStore| -> Vec<String> {
            store
                .get_comments("rec.mock")
                .unwrap()
                .iter()
                .map(|c| c.text.clone())
                .collect()
        };
        assert_eq!(texts(&fx.store), vec!["start", "ectopic", "cuff"]);

        fx.store
            .update_comment("rec.mock", id, "PVC", Some(6.0), Some("arrhythmia"))
            .unwrap();
        assert_eq!(texts(&fx.store), vec!["start", "cuff", "PVC"]);
        let moved = &fx.store.get_comments("rec.mock").unwrap()[2];
        assert_eq!(moved.label, "arrhythmia");
        assert_eq!(moved.time_sec, 6.0);
        assert_eq!(moved.tick_position, 600);

        // same time as an existing comment lands after it
        let start = fx.store.get_comments("rec.mock").unwrap()[0].time_sec;
        fx.store.update_comment("rec.mock", id, "PVC", Some(start), None).unwrap();
        assert_eq!(texts(&fx.store), vec!["start", "PVC", "cuff"]);
        assert_eq!(fx.store.get_comments("rec.mock").unwrap()[1].label, "PVC");
        let found = fx.store.get_comments_in_range("rec.mock", 0.0, 0.5).unwrap();
        assert_eq!(found.len(), 2);

        assert!(matches!(
            fx.store.update_comment("rec.mock", id, "x", Some(f64::NAN), None),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            fx.store.update_comment("rec.mock", 999, "x", None, None),
            Err(StoreError::CommentNotFound(999))
        ));
        assert_eq!(texts(&fx.store), vec!["start", "PVC", "cuff"]);
    }

    #[test]
    fn test_unload_and_clear() {
        let mut fx = loaded(StoreConfig::default());
        fx.store.get_trace("rec.mock", "ECG", &Params::new()).unwrap();
        fx.store.unload_file("rec.mock");
        assert!(matches!(
            fx.store.get_trace("rec.mock", "ECG", &Params::new()),
            Err(StoreError::FileNotLoaded(_))
        ));

        fx.store.load_file("rec.mock").unwrap();
        fx.store.load_file("other.mock").unwrap();
        assert_eq!(fx.opens.load(Ordering::SeqCst), 3);
        fx.store.clear_all();
        assert!(fx.store.list_loaded_files().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StoreConfig::default();
        config.chunk_loading.cache_size = 0;
        assert!(matches!(
            SignalStore::with_config(config),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}
