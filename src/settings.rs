use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::default_upload_dir;

pub const DEFAULT_VISION_ENDPOINT: &str = "https://ark.cn-beijing.volces.com/api/v3/chat/completions";
pub const DEFAULT_VISION_MODEL: &str = "doubao-seed-1-6-flash-250828";
pub const DEFAULT_GENERATION_ENDPOINT: &str =
    "https://ark.cn-beijing.volces.com/api/v3/images/generations";
pub const DEFAULT_GENERATION_MODEL: &str = "doubao-seed-image-1-5";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// Everything the service needs, resolved once at startup and handed to each
/// component when it is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vision_api_key: Option<String>,
    pub vision_endpoint: String,
    pub vision_model: String,
    pub generation_api_key: Option<String>,
    pub generation_endpoint: String,
    pub generation_model: String,
    pub generation_size: String,
    pub generation_watermark: bool,
    pub max_upload_bytes: u64,
    pub upload_dir: PathBuf,
    /// Uploads older than this are removed by the sweeper. Zero keeps them forever.
    pub upload_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub host: String,
    pub port: u16,
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vision_api_key: None,
            vision_endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            generation_api_key: None,
            generation_endpoint: DEFAULT_GENERATION_ENDPOINT.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            generation_size: "1024x1024".to_string(),
            generation_watermark: true,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            upload_dir: default_upload_dir(),
            upload_ttl_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
            request_timeout_secs: 120,
            host: "127.0.0.1".to_string(),
            port: 3001,
            log_dir: None,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_ttl(&self) -> Option<Duration> {
        (self.upload_ttl_secs > 0).then(|| Duration::from_secs(self.upload_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup; blank values are ignored.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("ARK_API_KEY") {
            self.vision_api_key = Some(v);
        }
        if let Some(v) = get("ARK_BASE_URL") {
            self.vision_endpoint = v;
        }
        if let Some(v) = get("DOUBAO_MODEL") {
            self.vision_model = v;
        }
        if let Some(v) = get("IMAGE_GENERATION_API_KEY") {
            self.generation_api_key = Some(v);
        }
        if let Some(v) = get("IMAGE_GENERATION_API") {
            self.generation_endpoint = v;
        }
        if let Some(v) = get("IMAGE_GENERATION_MODEL") {
            self.generation_model = v;
        }
        if let Some(v) = get("IMAGE_GENERATION_SIZE") {
            self.generation_size = v;
        }
        if let Some(v) = get("IMAGE_GENERATION_WATERMARK") {
            self.generation_watermark = parse_bool(&v)
                .ok_or_else(|| anyhow!("IMAGE_GENERATION_WATERMARK must be true or false, got {v:?}"))?;
        }
        if let Some(v) = get("MAX_FILE_SIZE") {
            self.max_upload_bytes = v.parse().with_context(|| format!("MAX_FILE_SIZE: {v:?}"))?;
        }
        if let Some(v) = get("UPLOAD_PATH") {
            self.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = get("UPLOAD_TTL_SECS") {
            self.upload_ttl_secs = v.parse().with_context(|| format!("UPLOAD_TTL_SECS: {v:?}"))?;
        }
        if let Some(v) = get("SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs =
                v.parse().with_context(|| format!("SWEEP_INTERVAL_SECS: {v:?}"))?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs =
                v.parse().with_context(|| format!("REQUEST_TIMEOUT_SECS: {v:?}"))?;
        }
        if let Some(v) = get("HOST") {
            self.host = v;
        }
        if let Some(v) = get("PORT") {
            self.port = v.parse().with_context(|| format!("PORT: {v:?}"))?;
        }
        if let Some(v) = get("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Everything that would make the server unusable, one line per problem.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.vision_api_key.is_none() {
            out.push("vision API key missing (set ARK_API_KEY)".to_string());
        }
        if self.generation_api_key.is_none() {
            out.push("image generation API key missing (set IMAGE_GENERATION_API_KEY)".to_string());
        }
        for (name, url) in [
            ("vision endpoint", &self.vision_endpoint),
            ("image generation endpoint", &self.generation_endpoint),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                out.push(format!("{name} must be an http(s) URL, got {url:?}"));
            }
        }
        if self.max_upload_bytes == 0 {
            out.push("max upload size must be greater than zero".to_string());
        }
        if self.request_timeout_secs == 0 {
            out.push("request timeout must be greater than zero".to_string());
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        Err(anyhow!("invalid configuration:\n  - {}", problems.join("\n  - ")))
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn load_settings_from_file(path: &Path) -> Result<Settings> {
    let bytes = fs::read(path).with_context(|| format!("read settings {}", path.display()))?;
    serde_json::from_slice::<Settings>(&bytes)
        .with_context(|| format!("parse settings {}", path.display()))
}

pub fn save_settings_to_file(path: &Path, s: &Settings) -> Result<()> {
    let json = serde_json::to_vec_pretty(s)?;
    fs::write(path, json).context("write settings")?;
    Ok(())
}

/// Shorten a credential for log lines: first and last five characters only.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 10 {
        return "***".to_string();
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 5..].iter().collect();
    format!("{head}...{tail}")
}
