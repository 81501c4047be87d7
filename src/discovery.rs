//! Test unit discovery and categorization.
//!
//! Check files are classified into two resource classes before scheduling:
//! API checks and device-to-device (D2D) checks. The classes have different
//! cost profiles and are bounded by independent concurrency limits, so a run
//! with unknown unit types cannot be scheduled correctly — strict mode turns
//! any uncategorizable unit into a hard error before execution starts.
//!
//! Classification is a pure pass over the given paths: deterministic for a
//! fixed layout, no retries, no I/O beyond the optional directory walk in
//! [`discover`].
//!
//! # Directory convention
//!
//! | Path component | Category |
//! |----------------|----------|
//! | `device_to_device` | DeviceToDevice |
//! | `api` | Api |
//! | neither | lenient: Api (recorded as a fallback); strict: error |
//!
//! The controller identity is the name of the directory containing the check
//! file, unless that directory is the category directory itself, in which
//! case the identity is `"default"`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Directory component marking device-to-device checks.
pub const D2D_DIR: &str = "device_to_device";

/// Directory component marking API checks.
pub const API_DIR: &str = "api";

/// Check file extensions collected by [`discover`].
const CHECK_EXTENSIONS: &[&str] = &["robot", "yaml", "yml"];

/// Errors that can occur during discovery and categorization.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Strict-mode classification failure. Fatal: aborts the run before any
    /// execution.
    #[error(
        "Cannot categorize test unit '{0}': not under an 'api' or 'device_to_device' directory"
    )]
    Uncategorized(PathBuf),

    /// I/O error walking the check tree.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The resource class a test unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitCategory {
    /// Controller API verification; bounded by the API concurrency limit.
    Api,
    /// Device-to-device verification; bounded by the device-session limit.
    DeviceToDevice,
}

/// One verification check, created during discovery and consumed once per
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUnit {
    /// Path of the check file.
    pub path: PathBuf,

    /// Resource class the unit schedules under.
    pub category: UnitCategory,

    /// Controller identity the unit authenticates and connects against.
    pub controller: String,
}

impl TestUnit {
    pub fn new(
        path: impl Into<PathBuf>,
        category: UnitCategory,
        controller: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            category,
            controller: controller.into(),
        }
    }

    /// A filesystem-safe key for this unit, used to name its stream shard.
    ///
    /// Distinct paths always map to distinct keys: sanitization alone can
    /// collide (`a/b.yaml` and `a-b.yaml`), so a short digest of the
    /// original path is appended.
    pub fn key(&self) -> String {
        let raw = self.path.to_string_lossy();
        let sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let digest = Sha256::digest(raw.as_bytes());
        let tag = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        format!("{}-{:08x}", sanitized, tag)
    }
}

/// The outcome of categorization: units split by resource class, plus the
/// paths that fell back to the API class in lenient mode.
#[derive(Debug, Default)]
pub struct Categorized {
    /// Units classified as API checks.
    pub api: Vec<TestUnit>,

    /// Units classified as device-to-device checks.
    pub d2d: Vec<TestUnit>,

    /// Paths that matched neither convention and defaulted to API.
    /// Recorded for diagnostics; empty in strict mode (strict errors out).
    pub fallbacks: Vec<PathBuf>,
}

impl Categorized {
    /// Total number of categorized units.
    pub fn len(&self) -> usize {
        self.api.len() + self.d2d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.api.is_empty() && self.d2d.is_empty()
    }

    /// Consumes the split into a single unit list (API first).
    pub fn into_units(self) -> Vec<TestUnit> {
        let mut units = self.api;
        units.extend(self.d2d);
        units
    }
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_string_lossy() == name)
}

/// Derives the controller identity from the unit's parent directory name.
fn controller_for(path: &Path) -> String {
    match path.parent().and_then(|p| p.file_name()) {
        Some(name) => {
            let name = name.to_string_lossy();
            if name == D2D_DIR || name == API_DIR {
                "default".to_string()
            } else {
                name.to_string()
            }
        }
        None => "default".to_string(),
    }
}

/// Classifies check paths into API and device-to-device units.
///
/// Lenient mode (default) treats paths outside the recognized directory
/// convention as API units and records the fallback for diagnostics. Strict
/// mode fails fast on the first uncategorizable path.
///
/// Deterministic: the same paths in the same order always produce the same
/// split.
pub fn categorize(paths: &[PathBuf], strict: bool) -> DiscoveryResult<Categorized> {
    let mut out = Categorized::default();

    for path in paths {
        if has_component(path, D2D_DIR) {
            out.d2d.push(TestUnit::new(
                path.clone(),
                UnitCategory::DeviceToDevice,
                controller_for(path),
            ));
        } else if has_component(path, API_DIR) {
            out.api.push(TestUnit::new(
                path.clone(),
                UnitCategory::Api,
                controller_for(path),
            ));
        } else if strict {
            return Err(DiscoveryError::Uncategorized(path.clone()));
        } else {
            warn!(
                "Treating uncategorized unit '{}' as an API check",
                path.display()
            );
            out.fallbacks.push(path.clone());
            out.api.push(TestUnit::new(
                path.clone(),
                UnitCategory::Api,
                controller_for(path),
            ));
        }
    }

    debug!(
        "Categorized {} units: {} api, {} d2d, {} fallbacks",
        out.len(),
        out.api.len(),
        out.d2d.len(),
        out.fallbacks.len()
    );

    Ok(out)
}

/// Walks a directory tree collecting check files.
///
/// Results are sorted so discovery is deterministic for a fixed layout.
pub fn discover(root: &Path) -> DiscoveryResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(root, &mut found)?;
    found.sort();
    debug!(
        "Discovered {} check files under {}",
        found.len(),
        root.display()
    );
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> DiscoveryResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, found)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| CHECK_EXTENSIONS.contains(&e))
        {
            found.push(path);
        }
    }
    Ok(())
}
