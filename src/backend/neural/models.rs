//! Model file management for the neural engine
//!
//! Resolves, verifies, and downloads the ONNX models and the character
//! dictionary the neural engine runs on. Files live under a per-user data
//! directory unless the config or `OCR_RELAY_MODELS_DIR` points elsewhere.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::protocol::ModelDescriptor;

/// Overrides where model files are stored.
pub const MODELS_DIR_ENV: &str = "OCR_RELAY_MODELS_DIR";
/// When set, no network fetches happen; missing models are an error.
pub const OFFLINE_ENV: &str = "OCR_RELAY_OFFLINE";

/// One row of the model table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
    /// Plausible on-disk size in bytes, a cheap integrity check.
    pub size_range: (u64, u64),
    pub language_codes: &'static [&'static str],
}

pub const DETECTION: ModelSpec = ModelSpec {
    name: "text-detection",
    filename: "det.onnx",
    url: "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx",
    size_range: (1_500_000, 6_000_000),
    language_codes: &["en"],
};

pub const RECOGNITION: ModelSpec = ModelSpec {
    name: "english-recognition",
    filename: "rec_en.onnx",
    url: "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/en.onnx",
    size_range: (5_000_000, 20_000_000),
    language_codes: &["en"],
};

pub const DICTIONARY: ModelSpec = ModelSpec {
    name: "english-dictionary",
    filename: "dict_en.txt",
    url: "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/en.txt",
    size_range: (100, 200_000),
    language_codes: &["en"],
};

/// Everything the neural engine knows how to install.
pub const MODEL_TABLE: &[ModelSpec] = &[DETECTION, RECOGNITION, DICTIONARY];

pub fn spec_by_name(name: &str) -> Option<&'static ModelSpec> {
    MODEL_TABLE.iter().find(|spec| spec.name == name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstalledModel {
    name: String,
    filename: String,
    size_bytes: u64,
    sha256: String,
    installed_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    models: Vec<InstalledModel>,
}

/// Locates model files on disk and fetches the ones that are missing.
pub struct ModelManager {
    models_dir: PathBuf,
    offline: bool,
}

impl ModelManager {
    /// Precedence for the storage directory: explicit config value, then
    /// the environment override, then the per-user data directory.
    pub fn new(configured_dir: Option<&Path>, offline: bool) -> Result<Self> {
        let models_dir = match configured_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => match std::env::var_os(MODELS_DIR_ENV) {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => default_models_dir()?,
            },
        };
        let offline = offline || std::env::var_os(OFFLINE_ENV).is_some();
        Self::with_dir(models_dir, offline)
    }

    pub fn with_dir(models_dir: PathBuf, offline: bool) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("failed to create models directory {}", models_dir.display()))?;
        Ok(Self { models_dir, offline })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn path_for(&self, spec: &ModelSpec) -> PathBuf {
        self.models_dir.join(spec.filename)
    }

    /// A model counts as installed when its file exists with a size inside
    /// the expected range. Truncated downloads fail this check.
    pub fn is_installed(&self, spec: &ModelSpec) -> bool {
        match std::fs::metadata(self.path_for(spec)) {
            Ok(meta) => {
                let size = meta.len();
                size >= spec.size_range.0 && size <= spec.size_range.1
            }
            Err(_) => false,
        }
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        MODEL_TABLE
            .iter()
            .map(|spec| ModelDescriptor {
                name: spec.name.to_string(),
                language_codes: spec.language_codes.iter().map(|code| code.to_string()).collect(),
                is_installed: self.is_installed(spec),
            })
            .collect()
    }

    /// Languages the model table covers, deduplicated and sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut codes: Vec<String> = MODEL_TABLE
            .iter()
            .flat_map(|spec| spec.language_codes.iter().map(|code| code.to_string()))
            .collect();
        codes.sort();
        codes.dedup();
        codes
    }

    /// Returns the on-disk path for `spec`, downloading it first if needed.
    pub fn ensure(&self, spec: &ModelSpec) -> Result<PathBuf> {
        let path = self.path_for(spec);
        if self.is_installed(spec) {
            debug!(model = spec.name, path = %path.display(), "model already installed");
            return Ok(path);
        }
        if self.offline {
            anyhow::bail!(
                "offline mode is on and {} is missing; place the file at {} manually",
                spec.name,
                path.display()
            );
        }
        info!(model = spec.name, url = spec.url, "downloading model");
        let digest = self.download(spec, &path)?;
        if !self.is_installed(spec) {
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            anyhow::bail!(
                "downloaded {} has implausible size {} bytes (expected {}..{})",
                spec.name,
                size,
                spec.size_range.0,
                spec.size_range.1
            );
        }
        if let Err(err) = self.record_install(spec, &path, &digest) {
            warn!(model = spec.name, error = %err, "failed to update model manifest");
        }
        Ok(path)
    }

    // Runs on blocking threads, so it owns a small runtime for the
    // streamed fetch rather than assuming a reactor is available.
    fn download(&self, spec: &ModelSpec, path: &Path) -> Result<String> {
        let runtime = tokio::runtime::Runtime::new().context("failed to create download runtime")?;
        runtime.block_on(fetch_to_file(spec.url, path))
    }

    fn record_install(&self, spec: &ModelSpec, path: &Path, digest: &str) -> Result<()> {
        let mut manifest = self.load_manifest();
        manifest.models.retain(|entry| entry.name != spec.name);
        manifest.models.push(InstalledModel {
            name: spec.name.to_string(),
            filename: spec.filename.to_string(),
            size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            sha256: digest.to_string(),
            installed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        });
        let serialized = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(self.manifest_path(), serialized).context("failed to write model manifest")?;
        Ok(())
    }

    fn load_manifest(&self) -> Manifest {
        match std::fs::read_to_string(self.manifest_path()) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Manifest::default(),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.models_dir.join("manifest.json")
    }
}

fn default_models_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "ocrrelay", "OcrRelay")
        .context("could not determine a per-user data directory")?;
    Ok(dirs.data_dir().join("models"))
}

/// Streams `url` into a sibling `.part` file, hashing as it goes, and
/// renames into place once complete. Returns the hex SHA-256 digest.
async fn fetch_to_file(url: &str, path: &Path) -> Result<String> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("server rejected download of {url}"))?;

    let partial = path.with_extension("part");
    let mut file = std::fs::File::create(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download stream broke")?;
        hasher.update(&chunk);
        file.write_all(&chunk).context("failed to write model data")?;
        downloaded += chunk.len() as u64;
    }
    file.flush().context("failed to flush model data")?;
    drop(file);

    std::fs::rename(&partial, path)
        .with_context(|| format!("failed to move download into {}", path.display()))?;
    let digest = format!("{:x}", hasher.finalize());
    info!(path = %path.display(), bytes = downloaded, sha256 = %digest, "model downloaded");
    Ok(digest)
}
