// Inspect a PHX recording: channels, comments and derived heart rate.
// Without an argument a synthetic two-record recording is written first.

use anyhow::{Context, Result};
use physio_store::core::constants::CompressionType;
use physio_store::{ChunkLoader, Params, PhxWriter, SignalStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, Level};

const FS: f64 = 250.0;

fn synthetic_ecg(seconds: f64, rr_sec: f64, rng: &mut StdRng) -> Vec<f64> {
    let n = (seconds * FS) as usize;
    let rr = (rr_sec * FS) as usize;
    (0..n)
        .map(|i| {
            let d = (i % rr) as f64 - rr as f64 / 2.0;
            let qrs = (-d * d / 8.0).exp();
            qrs + rng.gen_range(-0.05..0.05)
        })
        .collect()
}

fn write_synthetic(path: &PathBuf) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut writer = PhxWriter::new(2, CompressionType::Zlib);
    writer.add_channel("ECG", "mV", FS)?;
    writer.add_channel("FBP", "mmHg", 100.0)?;

    writer.add_record("ECG", 0, &synthetic_ecg(30.0, 0.8, &mut rng))?;
    writer.add_record("ECG", 1, &synthetic_ecg(30.0, 0.6, &mut rng))?;
    let pressure: Vec<f64> = (0..3000).map(|i| 95.0 + 20.0 * (i as f64 / 80.0).sin()).collect();
    writer.add_record("FBP", 0, &pressure)?;
    writer.add_record("FBP", 1, &pressure)?;

    writer.add_annotation("", 0, 250, None, 1, "baseline")?;
    writer.add_annotation("ECG", 1, 1250, None, 2, "exercise")?;
    writer.write_to(path)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let tmp = tempfile::tempdir()?;
    let path = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            let path = tmp.path().join("synthetic.phx");
            write_synthetic(&path)?;
            path
        }
    };

    let mut store = SignalStore::new();
    store
        .load_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    let meta = store.get_metadata(&path)?;
    info!("{} records, recorded at {:?}", meta.n_records, meta.recorded_at);
    for channel in store.get_available_channels(&path)? {
        info!("  channel {}", channel);
    }
    for comment in store.get_comments(&path)? {
        info!("  comment {:>8.2}s {}", comment.time_sec, comment.text);
    }

    let methods = store.detector_registry().list();
    for method in methods {
        let params = Params::new().with("method", method.as_str());
        match store.get_trace(&path, "HR_gen", &params) {
            Ok(hr) => {
                let valid: Vec<f64> = hr.samples().iter().copied().filter(|v| v.is_finite()).collect();
                let mean = valid.iter().sum::<f64>() / valid.len().max(1) as f64;
                info!(
                    "{:>11}: {} R peaks, {} samples, mean {:.1} bpm",
                    method,
                    hr.r_peaks().len(),
                    hr.len(),
                    mean
                );
            }
            Err(e) => info!("{:>11}: {}", method, e),
        }
    }

    let available = store.get_available_channels(&path)?;
    let channels: Vec<&str> = available.iter().map(String::as_str).collect();
    let mut chunks = ChunkLoader::from_config(store.config());
    let window = chunks.get_chunk(&mut store, &path, &channels, 10.0, 5.0, &Params::new())?;
    for (channel, samples) in window.iter() {
        info!("window [10s, 15s) {}: {} samples", channel, samples.len());
    }
    info!("export names: {:?}", store.get_available_channels_for_export(&path)?);

    Ok(())
}
