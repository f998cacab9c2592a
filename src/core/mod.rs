pub mod chunk;
pub mod compression;
pub mod config;
pub mod constants;
pub mod detection;
pub mod error;
pub mod filter;
pub mod format;
pub mod heart_rate;
pub mod params;
pub mod reader;
pub mod shared;
pub mod signal;
pub mod store;
pub mod wavelet;
pub mod writer;
