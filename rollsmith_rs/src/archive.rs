use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::feature::{DailyRecord, FeatureRecord};

pub const ARCHIVE_EXTENSION: &str = "gobz";

/// Continuous series of one stream as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "DailyRecords")]
    pub daily_records: Vec<DailyRecord>,
    #[serde(rename = "IntradayRecords")]
    pub intraday_records: Vec<FeatureRecord>,
}

impl Archive {
    /// Daily dates and intraday timestamps must both be strictly ascending.
    pub fn validate_order(&self) -> Result<()> {
        if let Some(pair) = self
            .daily_records
            .windows(2)
            .find(|pair| pair[0].date >= pair[1].date)
        {
            return Err(anyhow!(
                "Daily records of {} are not ascending at {}",
                self.symbol,
                pair[1].date
            ));
        }
        if let Some(pair) = self
            .intraday_records
            .windows(2)
            .find(|pair| pair[0].timestamp >= pair[1].timestamp)
        {
            return Err(anyhow!(
                "Intraday records of {} are not ascending at {}",
                self.symbol,
                pair[1].timestamp
            ));
        }
        Ok(())
    }
}

/// `{archive_dir}/{symbol}.F{f_number}.gobz`
pub fn archive_path(archive_dir: &Path, symbol: &str, f_number: usize) -> PathBuf {
    archive_dir.join(format!("{symbol}.F{f_number}.{ARCHIVE_EXTENSION}"))
}

/// Encodes the archive into a sibling temp file and renames it into place.
/// Returns the compressed size in bytes.
pub fn write_archive(path: &Path, archive: &Archive) -> Result<u64> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Unable to create archive directory {}", directory.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Archive path {} has no file name", path.display()))?;
    let temp_path = directory.join(format!(".{}.tmp", file_name.to_string_lossy()));

    {
        let file = File::create(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        rmp_serde::encode::write_named(&mut encoder, archive)
            .with_context(|| format!("Failed to encode archive {}", archive.symbol))?;
        let mut writer = encoder
            .finish()
            .with_context(|| format!("Failed to finish gzip stream {}", temp_path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {}", temp_path.display()))?;
    }
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to move {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    let size = std::fs::metadata(path)
        .with_context(|| format!("Unable to stat {}", path.display()))?
        .len();
    Ok(size)
}

pub fn read_archive(path: &Path) -> Result<Archive> {
    let file = File::open(path).with_context(|| format!("Failed to open archive {}", path.display()))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let archive: Archive = rmp_serde::decode::from_read(decoder)
        .with_context(|| format!("Failed to decode archive {}", path.display()))?;
    Ok(archive)
}
