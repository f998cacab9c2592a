// Format constants for PHX recordings and store defaults

pub const MAGIC: &[u8; 4] = b"PHYX";
pub const RECORD_MAGIC: &[u8; 4] = b"RECD";
pub const INDEX_MAGIC: &[u8; 4] = b"IDXT";
pub const ANNOTATION_MAGIC: &[u8; 4] = b"ANNT";
pub const FOOTER_MAGIC: &[u8; 4] = b"FTER";

pub const FORMAT_VERSION: u8 = 1;
pub const PHX_EXTENSION: &str = ".phx";

// Compression codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
    Zlib = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl CompressionType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zlib),
            2 => Some(CompressionType::Lz4),
            3 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

// One sample: value(f64)
pub const SAMPLE_SIZE: usize = 8;

// File header prefix: MAGIC(4) version(u8) comp(u8) created(f64) n_channels(u16) n_records(u32)
pub const HEADER_PREFIX_SIZE: usize = 4 + 1 + 1 + 8 + 2 + 4; // 20 bytes

// Record block header: channel(u16) record(u32) n_samples(u32) raw_len(u32) comp_len(u32)
pub const RECORD_HEADER_SIZE: usize = 2 + 4 + 4 + 4 + 4; // 18 bytes

// Index entry: channel(u16) record(u32) offset(u64) n_samples(u32)
pub const INDEX_ENTRY_SIZE: usize = 2 + 4 + 8 + 4; // 18 bytes

// Annotation entry: channel(u16) record(u32) tick(u64) tick_dt(f64) id(u32), then text(str)
pub const ANNOTATION_ENTRY_SIZE: usize = 2 + 4 + 8 + 8 + 4; // 26 bytes

// Footer: FOOTER_MAGIC(4) index_offset(u64) annotation_offset(u64)
pub const FOOTER_SIZE: usize = 4 + 8 + 8; // 20 bytes

// Channel slot used by annotations that apply to every channel
pub const GLOBAL_CHANNEL: u16 = u16::MAX;

// Derived heart-rate channel
pub const DERIVED_HR_CHANNEL: &str = "HR_gen";
pub const HR_SIGNAL_NAME: &str = "HR";
pub const HR_UNITS: &str = "bpm";

// Heart-rate generation defaults
pub const DEFAULT_HR_METHOD: &str = "dwt";
pub const DEFAULT_WAVELET: &str = "haar";
pub const DEFAULT_LEVEL: i64 = 4;
pub const DEFAULT_MIN_RR_SEC: f64 = 0.6;
pub const DEFAULT_HEIGHT_STD: f64 = 1.0;
pub const DEFAULT_DERIVED_CACHE_SIZE: usize = 5;

// Raw trace assembly
pub const DEFAULT_GAP_SEC: f64 = 3.0;
pub const DEFAULT_BOUNDARY_BUFFER_SEC: f64 = 1.0;
pub const DEFAULT_ECG_CHANNEL: &str = "ECG";

// Chunk access
pub const DEFAULT_CHUNK_CACHE_SIZE: usize = 50;

// User-created comments get ids well above anything a recording carries
pub const FIRST_USER_COMMENT_ID: u32 = 10_000;
