// Thread-safe handle over a signal store and its chunk loader

use crate::core::chunk::{ChunkCacheStats, ChunkData, ChunkLoader};
use crate::core::error::{Result, StoreError};
use crate::core::params::Params;
use crate::core::signal::{Comment, Signal};
use crate::core::store::{FileMetadata, SignalStore};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

struct Inner {
    store: SignalStore,
    chunks: ChunkLoader,
}

/// Cloneable handle; every call holds one lock for its whole duration, so
/// concurrent requests for the same derived trace compute it once.
#[derive(Clone)]
pub struct SharedSignalStore {
    inner: Arc<Mutex<Inner>>,
}

impl SharedSignalStore {
    /// The chunk cache is sized from the store's configuration.
    pub fn new(store: SignalStore) -> Self {
        let chunks = ChunkLoader::from_config(store.config());
        Self::with_chunk_loader(store, chunks)
    }

    pub fn with_chunk_loader(store: SignalStore, chunks: ChunkLoader) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { store, chunks })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Runs `f` with exclusive access to the store.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut SignalStore) -> T) -> Result<T> {
        let mut inner = self.lock()?;
        Ok(f(&mut inner.store))
    }

    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.lock()?.store.load_file(path)
    }

    /// Unloading also drops every cached chunk.
    pub fn unload_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut inner = self.lock()?;
        inner.store.unload_file(path);
        inner.chunks.clear();
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.store.clear_all();
        inner.chunks.clear();
        Ok(())
    }

    pub fn get_trace<P: AsRef<Path>>(&self, path: P, channel: &str, params: &Params) -> Result<Arc<Signal>> {
        self.lock()?.store.get_trace(path, channel, params)
    }

    pub fn get_chunk<P: AsRef<Path>>(
        &self,
        path: P,
        channels: &[&str],
        start_sec: f64,
        duration_sec: f64,
        hr_params: &Params,
    ) -> Result<Arc<ChunkData>> {
        let mut guard = self.lock()?;
        let Inner { store, chunks } = &mut *guard;
        chunks.get_chunk(store, path, channels, start_sec, duration_sec, hr_params)
    }

    pub fn chunk_stats(&self) -> Result<ChunkCacheStats> {
        Ok(self.lock()?.chunks.stats())
    }

    pub fn get_metadata<P: AsRef<Path>>(&self, path: P) -> Result<FileMetadata> {
        self.lock()?.store.get_metadata(path).cloned()
    }

    pub fn get_available_channels<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>> {
        self.lock()?.store.get_available_channels(path)
    }

    pub fn get_comments<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Comment>> {
        Ok(self.lock()?.store.get_comments(path)?.to_vec())
    }

    pub fn add_user_comment<P: AsRef<Path>>(
        &self,
        path: P,
        text: &str,
        time_sec: f64,
        channel: &str,
    ) -> Result<u32> {
        self.lock()?.store.add_user_comment(path, text, time_sec, channel)
    }
}
