// Physiological signal store
// Main library entry point

pub mod core;

// Re-export main types
pub use core::chunk::{ChunkCacheStats, ChunkData, ChunkLoader};
pub use core::config::StoreConfig;
pub use core::detection::{Detection, DetectionWarning, DetectorRegistry, PeakDetector};
pub use core::error::{Result, StoreError};
pub use core::heart_rate::{derive_heart_rate, derive_heart_rate_with, HrDerivation};
pub use core::params::{ParamKey, ParamValue, Params};
pub use core::reader::{ChannelReader, PhxReader};
pub use core::shared::SharedSignalStore;
pub use core::signal::{Comment, Signal, Timebase};
pub use core::store::{FileMetadata, ReaderRegistry, SignalStore};
pub use core::writer::PhxWriter;
