// Windowed access to store signals with an LRU cache of recent windows

use crate::core::config::StoreConfig;
use crate::core::constants::{DEFAULT_CHUNK_CACHE_SIZE, DERIVED_HR_CHANNEL};
use crate::core::error::{Result, StoreError};
use crate::core::params::Params;
use crate::core::signal::{Signal, Timebase};
use crate::core::store::SignalStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Samples of one window, by channel name.
pub type ChunkData = BTreeMap<String, Vec<f64>>;

/// Cache key: file, sorted channels, start and duration in hundredths of a
/// second.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub file_path: String,
    pub channels: Vec<String>,
    pub start_cs: i64,
    pub duration_cs: i64,
}

impl ChunkKey {
    pub fn new(file_path: &Path, channels: &[&str], start_sec: f64, duration_sec: f64) -> Self {
        let mut sorted: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        sorted.sort();
        sorted.dedup();
        Self {
            file_path: file_path.display().to_string(),
            channels: sorted,
            start_cs: (start_sec * 100.0).round() as i64,
            duration_cs: (duration_sec * 100.0).round() as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Serves `[start, start + duration)` windows of store signals.
///
/// The loader only reads from the store. Windows of the derived channel are
/// cached without their heart-rate parameters, so callers must [`clear`]
/// after changing them.
///
/// [`clear`]: ChunkLoader::clear
pub struct ChunkLoader {
    capacity: usize,
    entries: HashMap<ChunkKey, (Arc<ChunkData>, u64)>,
    /// Access tick to key, oldest first.
    recency: BTreeMap<u64, ChunkKey>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl Default for ChunkLoader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CACHE_SIZE)
    }
}

impl ChunkLoader {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Sized by `chunk_loading.cache_size`.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.chunk_loading.cache_size)
    }

    pub fn get_chunk<P: AsRef<Path>>(
        &mut self,
        store: &mut SignalStore,
        path: P,
        channels: &[&str],
        start_sec: f64,
        duration_sec: f64,
        hr_params: &Params,
    ) -> Result<Arc<ChunkData>> {
        if !start_sec.is_finite() || !(duration_sec >= 0.0) {
            return Err(StoreError::InvalidInput(format!(
                "invalid window start={} duration={}",
                start_sec, duration_sec
            )));
        }

        let path = path.as_ref();
        let key = ChunkKey::new(path, channels, start_sec, duration_sec);
        if let Some(chunk) = self.touch(&key) {
            self.hits += 1;
            return Ok(chunk);
        }
        self.misses += 1;

        let no_params = Params::new();
        let mut data = ChunkData::new();
        for &channel in channels {
            let params = if channel.eq_ignore_ascii_case(DERIVED_HR_CHANNEL) {
                hr_params
            } else {
                &no_params
            };
            let signal = store.get_trace(path, channel, params)?;
            data.insert(
                channel.to_string(),
                slice_window(&signal, start_sec, duration_sec).to_vec(),
            );
        }

        let chunk = Arc::new(data);
        self.insert(key, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Single-channel form of [`ChunkLoader::get_chunk`].
    pub fn get_channel_chunk<P: AsRef<Path>>(
        &mut self,
        store: &mut SignalStore,
        path: P,
        channel: &str,
        start_sec: f64,
        duration_sec: f64,
        hr_params: &Params,
    ) -> Result<Vec<f64>> {
        let chunk = self.get_chunk(store, path, &[channel], start_sec, duration_sec, hr_params)?;
        Ok(chunk.get(channel).cloned().unwrap_or_default())
    }

    fn touch(&mut self, key: &ChunkKey) -> Option<Arc<ChunkData>> {
        self.tick += 1;
        let tick = self.tick;
        let (chunk, last) = self.entries.get_mut(key)?;
        self.recency.remove(&*last);
        *last = tick;
        self.recency.insert(tick, key.clone());
        Some(Arc::clone(chunk))
    }

    fn insert(&mut self, key: ChunkKey, chunk: Arc<ChunkData>) {
        self.tick += 1;
        if let Some((_, old_tick)) = self.entries.insert(key.clone(), (chunk, self.tick)) {
            self.recency.remove(&old_tick);
        }
        self.recency.insert(self.tick, key);

        while self.entries.len() > self.capacity {
            match self.recency.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                    debug!("Evicted chunk {:?}", oldest);
                }
                None => break,
            }
        }
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    pub fn stats(&self) -> ChunkCacheStats {
        ChunkCacheStats {
            size: self.entries.len(),
            max_size: self.capacity,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Window `[start, start + duration)` of `signal`, clipped to its bounds.
/// Non-empty signals always yield at least one sample.
pub fn slice_window(signal: &Signal, start_sec: f64, duration_sec: f64) -> &[f64] {
    let samples = signal.samples();
    let len = samples.len();
    if len == 0 {
        return samples;
    }

    let (start, end) = match signal.timebase() {
        Timebase::Uniform => {
            let fs = signal.fs();
            (
                (start_sec * fs) as i64,
                ((start_sec + duration_sec) * fs) as i64,
            )
        }
        Timebase::Explicit => {
            let time = signal.time();
            let end_sec = start_sec + duration_sec;
            (
                time.partition_point(|&t| t < start_sec) as i64,
                time.partition_point(|&t| t < end_sec) as i64,
            )
        }
    };

    let start = start.clamp(0, len as i64 - 1) as usize;
    let end = end.clamp(start as i64 + 1, len as i64) as usize;
    &samples[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::tests::fixture;

    fn store() -> SignalStore {
        let mut fx = fixture(StoreConfig::default());
        fx.store.load_file("rec.mock").unwrap();
        fx.store
    }

    #[test]
    fn test_slice_clips_to_signal() {
        let sig = Signal::uniform("x", (0..10).map(|i| i as f64).collect(), 2.0, "").unwrap();
        assert_eq!(slice_window(&sig, 0.0, 1e9).len(), 10);
        assert_eq!(slice_window(&sig, 1.0, 1.0), &[2.0, 3.0]);
        assert_eq!(slice_window(&sig, 100.0, 5.0), &[9.0]);
        assert_eq!(slice_window(&sig, -3.0, 0.0), &[0.0]);

        let empty = Signal::uniform("x", Vec::new(), 2.0, "").unwrap();
        assert!(slice_window(&empty, 0.0, 1.0).is_empty());
    }

    #[test]
    fn test_slice_explicit_timebase() {
        let values = vec![60.0, 61.0, 62.0, 63.0];
        let sig = Signal::explicit("HR", values, vec![-0.5, 0.0, 0.5, 1.0], 1.0, "bpm").unwrap();
        assert_eq!(slice_window(&sig, 0.0, 1.0), &[61.0, 62.0]);
        assert_eq!(slice_window(&sig, -10.0, 1e9).len(), 4);
        assert_eq!(slice_window(&sig, 50.0, 1.0), &[63.0]);
    }

    #[test]
    fn test_chunk_clipped_to_length() {
        let mut store = store();
        let mut loader = ChunkLoader::new(10);
        let chunk = loader
            .get_chunk(&mut store, "rec.mock", &["ECG", "FBP"], 0.0, 1e9, &Params::new())
            .unwrap();
        assert_eq!(chunk["ECG"].len(), 800);
        assert_eq!(chunk["FBP"].len(), 700);

        let tail = loader
            .get_channel_chunk(&mut store, "rec.mock", "ECG", 7.995, 1e9, &Params::new())
            .unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_derived_channel_window() {
        let mut store = store();
        let mut loader = ChunkLoader::default();
        let hr = loader
            .get_channel_chunk(&mut store, "rec.mock", "HR_gen", -10.0, 1e9, &Params::new().with("level", 4))
            .unwrap();
        assert!(hr.iter().all(|v| (v - 75.0).abs() < 1e-9));
        assert_eq!(hr.len(), 880);
        assert_eq!(store.cached_derived_keys("rec.mock").unwrap().len(), 1);
    }

    #[test]
    fn test_key_rounding_and_channel_order() {
        let mut store = store();
        let mut loader = ChunkLoader::new(10);
        let a = loader
            .get_chunk(&mut store, "rec.mock", &["FBP", "ECG"], 1.001, 2.0, &Params::new())
            .unwrap();
        let b = loader
            .get_chunk(&mut store, "rec.mock", &["ECG", "FBP"], 1.004, 2.0, &Params::new())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.stats().hits, 1);
        assert_eq!(loader.stats().misses, 1);
    }

    #[test]
    fn test_lru_touch_before_overflow() {
        let mut store = store();
        let mut loader = ChunkLoader::new(3);
        let mut window = |loader: &mut ChunkLoader, start: f64| {
            loader
                .get_chunk(&mut store, "rec.mock", &["ECG"], start, 1.0, &Params::new())
                .unwrap()
        };

        let first = window(&mut loader, 0.0);
        window(&mut loader, 1.0);
        window(&mut loader, 2.0);
        // touch the oldest entry, then overflow
        window(&mut loader, 0.0);
        window(&mut loader, 3.0);

        let path = Path::new("rec.mock");
        assert_eq!(loader.stats().size, 3);
        assert!(loader.contains(&ChunkKey::new(path, &["ECG"], 0.0, 1.0)));
        assert!(!loader.contains(&ChunkKey::new(path, &["ECG"], 1.0, 1.0)));
        assert!(loader.contains(&ChunkKey::new(path, &["ECG"], 2.0, 1.0)));
        assert!(loader.contains(&ChunkKey::new(path, &["ECG"], 3.0, 1.0)));

        let again = window(&mut loader, 0.0);
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_capacity_from_config() {
        let mut config = StoreConfig::default();
        config.chunk_loading.cache_size = 3;
        let mut fx = fixture(config);
        fx.store.load_file("rec.mock").unwrap();
        let mut loader = ChunkLoader::from_config(fx.store.config());
        assert_eq!(loader.stats().max_size, 3);

        for start in [0.0, 1.0, 2.0, 3.0] {
            loader
                .get_chunk(&mut fx.store, "rec.mock", &["ECG"], start, 1.0, &Params::new())
                .unwrap();
        }
        assert_eq!(loader.stats().size, 3);
        assert!(!loader.contains(&ChunkKey::new(Path::new("rec.mock"), &["ECG"], 0.0, 1.0)));
        assert_eq!(ChunkLoader::from_config(&StoreConfig::default()).stats().max_size, 50);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let mut store = store();
        let mut loader = ChunkLoader::new(4);
        assert!(matches!(
            loader.get_chunk(&mut store, "rec.mock", &["ECG", "SpO2"], 0.0, 1.0, &Params::new()),
            Err(StoreError::ChannelNotFound(_))
        ));
        assert!(loader
            .get_chunk(&mut store, "rec.mock", &["ECG"], f64::NAN, 1.0, &Params::new())
            .is_err());
        assert_eq!(loader.stats().size, 0);
    }

    #[test]
    fn test_clear() {
        let mut store = store();
        let mut loader = ChunkLoader::new(4);
        loader
            .get_chunk(&mut store, "rec.mock", &["ECG"], 0.0, 1.0, &Params::new())
            .unwrap();
        loader.clear();
        assert_eq!(
            loader.stats(),
            ChunkCacheStats {
                size: 0,
                max_size: 4,
                hits: 0,
                misses: 1
            }
        );
    }
}
