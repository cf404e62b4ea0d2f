//! Screenshot and report files produced by a run

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::E2eResult;

/// A screenshot written during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub sha256: String,
}

/// Names and records the files of one scenario run
pub struct ArtifactStore {
    dir: PathBuf,
    scenario: String,
    records: Vec<ArtifactRecord>,
}

impl ArtifactStore {
    pub fn new(dir: &Path, scenario: &str) -> E2eResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            scenario: sanitize(scenario),
            records: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{scenario}_{step}.png`
    pub fn screenshot_path(&self, step_name: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.png", self.scenario, sanitize(step_name)))
    }

    /// `{scenario}_error.png`
    pub fn error_screenshot_path(&self) -> PathBuf {
        self.dir.join(format!("{}_error.png", self.scenario))
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(format!("{}_report.json", self.scenario))
    }

    /// Check a freshly written screenshot decodes and add it to the manifest.
    pub fn record(&mut self, name: &str, path: &Path) -> E2eResult<&ArtifactRecord> {
        let (width, height) = image::image_dimensions(path)?;
        let sha256 = hash_file(path)?;
        debug!("Recorded artifact '{}' ({}x{}, {})", name, width, height, &sha256[..12]);

        self.records.push(ArtifactRecord {
            name: name.to_string(),
            path: path.to_path_buf(),
            width,
            height,
            sha256,
        });
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn records(&self) -> &[ArtifactRecord] {
        &self.records
    }

    /// Write a JSON report next to the screenshots
    pub fn write_report<T: Serialize>(&self, report: &T) -> E2eResult<PathBuf> {
        let path = self.report_path();
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json)?;
        info!("Report written to: {}", path.display());
        Ok(path)
    }
}

/// Hash a file using SHA256
fn hash_file(path: &Path) -> E2eResult<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

/// Keep artifact names to `[A-Za-z0-9._-]`. Non-ASCII characters are
/// hex-escaped (`更` becomes `u66f4`) so distinct labels stay distinct.
pub fn sanitize(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            cleaned.push(c);
        } else if c.is_ascii() {
            cleaned.push('-');
        } else {
            cleaned.push_str(&format!("u{:04x}", c as u32));
        }
    }
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
