use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::encoder::extension_for_mime;
use crate::error::ServiceError;
use crate::settings::Settings;
use crate::utils::timestamp_millis;

pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif"];

/// A file accepted by the upload handler and sitting in the upload directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub path: String,
    pub filename: String,
    pub original_name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(skip, default = "SystemTime::now")]
    pub created_at: SystemTime,
}

/// Canonical MIME type for an accepted upload, `None` if the type is not allowed.
pub fn normalize_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("image/jpeg"),
        "image/png" => Some("image/png"),
        "image/gif" => Some("image/gif"),
        _ => None,
    }
}

/// `image-<unix millis>-<random>.<ext>`; the original extension survives when it is
/// a plain short token, otherwise one is derived from the MIME type.
pub fn generate_filename(original_name: &str, mime: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| extension_for_mime(mime).to_string());
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    format!("image-{}-{}.{}", timestamp_millis(), suffix, ext)
}

/// True for names of the shape [`generate_filename`] produces. The sweeper touches
/// nothing else.
pub fn is_generated_filename(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("image-") else {
        return false;
    };
    let mut parts = rest.splitn(2, '-');
    let (Some(millis), Some(tail)) = (parts.next(), parts.next()) else {
        return false;
    };
    let Some((suffix, ext)) = tail.split_once('.') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(millis)
        && digits(suffix)
        && !ext.is_empty()
        && ext.len() <= 5
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Flat upload directory plus a registry of what this process wrote into it.
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Option<Duration>,
    files: DashMap<String, UploadedFile>,
}

impl UploadStore {
    pub fn new(dir: PathBuf, max_bytes: u64, ttl: Option<Duration>) -> Self {
        Self {
            dir,
            max_bytes,
            ttl,
            files: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.upload_dir.clone(),
            settings.max_upload_bytes,
            settings.upload_ttl(),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn get(&self, filename: &str) -> Option<UploadedFile> {
        self.files.get(filename).map(|f| f.clone())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn check_mime(&self, mime: Option<&str>) -> Result<&'static str, ServiceError> {
        let raw = mime.unwrap_or_default();
        normalize_mime(raw).ok_or_else(|| {
            ServiceError::Validation(format!(
                "unsupported file type {:?}: only JPEG, PNG and GIF images are allowed",
                raw
            ))
        })
    }

    pub fn check_size(&self, size: u64) -> Result<(), ServiceError> {
        if size > self.max_bytes {
            return Err(ServiceError::Validation(format!(
                "file too large: {} bytes exceeds the {} byte limit",
                size, self.max_bytes
            )));
        }
        Ok(())
    }

    /// Validate and persist one upload. Nothing touches disk unless both checks pass.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn save(
        &self,
        original_name: &str,
        mime: Option<&str>,
        bytes: &[u8],
    ) -> Result<UploadedFile, ServiceError> {
        let mime = self.check_mime(mime)?;
        self.check_size(bytes.len() as u64)?;
        if bytes.is_empty() {
            return Err(ServiceError::Validation("uploaded file is empty".to_string()));
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        // create_new never clobbers; a clash just means another draw.
        let mut attempts = 0;
        let (filename, path, mut file) = loop {
            let filename = generate_filename(original_name, mime);
            let path = self.dir.join(&filename);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (filename, path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        file.write_all(bytes).await?;
        file.flush().await?;

        let uploaded = UploadedFile {
            path: path.display().to_string(),
            filename: filename.clone(),
            original_name: original_name.to_string(),
            size: bytes.len() as u64,
            mime_type: mime.to_string(),
            created_at: SystemTime::now(),
        };
        self.files.insert(filename, uploaded.clone());
        info!(path = %uploaded.path, mime = mime, "stored upload");
        Ok(uploaded)
    }

    /// Map a client-supplied path onto a file inside the upload directory.
    ///
    /// Only the final path component is honoured, so callers cannot reach outside
    /// the directory; anything that does not name an existing upload is not found.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, ServiceError> {
        let not_found = || ServiceError::NotFound(format!("file not found: {requested}"));
        let name = Path::new(requested.trim())
            .file_name()
            .ok_or_else(not_found)?;
        let candidate = self.dir.join(name);
        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => Ok(candidate),
            Ok(_) => Err(not_found()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn sweep(&self) -> Result<usize, ServiceError> {
        self.sweep_at(SystemTime::now()).await
    }

    /// Delete every upload whose age at `now` is at least the TTL. Files left by an
    /// earlier process are recognized by name and aged by their modification time;
    /// other files in the directory are never touched.
    pub async fn sweep_at(&self, now: SystemTime) -> Result<usize, ServiceError> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let registered = self.files.get(&name).map(|f| f.created_at);
            if registered.is_none() && !is_generated_filename(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(file = %name, error = %e, "cannot stat upload, skipping");
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let created = match registered {
                Some(created) => created,
                None => match meta.modified() {
                    Ok(modified) => modified,
                    Err(e) => {
                        warn!(file = %name, error = %e, "no modification time, skipping");
                        continue;
                    }
                },
            };
            let age = now.duration_since(created).unwrap_or_default();
            if age < ttl {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    self.files.remove(&name);
                    removed += 1;
                    debug!(file = %name, age_secs = age.as_secs(), "expired upload removed");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.files.remove(&name);
                }
                Err(e) => warn!(file = %name, error = %e, "failed to remove expired upload"),
            }
        }
        if removed > 0 {
            info!(removed, "upload sweep finished");
        }
        Ok(removed)
    }

    /// Run `sweep` every `interval` until the token is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("upload sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "upload sweep failed");
                        }
                    }
                }
            }
        })
    }
}
