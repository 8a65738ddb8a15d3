use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration: defaults, then an optional TOML file, then
/// `LOOKOUT_*` environment variables. Command-line flags go last and are
/// applied by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inference backend base URL (default: http://localhost:5001).
    pub backend_url: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Milliseconds between analysis ticks.
    pub tick_interval_ms: u64,
    /// Upper bound on one backend request, in seconds.
    pub request_timeout_secs: u64,
    pub render_fps: u32,
    /// Overlay canvas size. Boxes are rescaled from the capture size.
    pub display_width: u32,
    pub display_height: u32,
    /// JPEG quality for submitted frames, 1-100.
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:5001".to_string(),
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            tick_interval_ms: 1000,
            request_timeout_secs: 10,
            render_fps: 30,
            display_width: 640,
            display_height: 480,
            jpeg_quality: 80,
        }
    }
}

impl Config {
    /// Load from `path` (or `$LOOKOUT_CONFIG`) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("LOOKOUT_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `LOOKOUT_*` variables looked up with `get`.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("LOOKOUT_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(device) = get("LOOKOUT_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        self.capture_width = env_parse(&get, "LOOKOUT_CAPTURE_WIDTH", self.capture_width);
        self.capture_height = env_parse(&get, "LOOKOUT_CAPTURE_HEIGHT", self.capture_height);
        self.tick_interval_ms = env_parse(&get, "LOOKOUT_TICK_INTERVAL_MS", self.tick_interval_ms);
        self.request_timeout_secs =
            env_parse(&get, "LOOKOUT_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);
        self.render_fps = env_parse(&get, "LOOKOUT_RENDER_FPS", self.render_fps);
        self.display_width = env_parse(&get, "LOOKOUT_DISPLAY_WIDTH", self.display_width);
        self.display_height = env_parse(&get, "LOOKOUT_DISPLAY_HEIGHT", self.display_height);
        self.jpeg_quality = env_parse(&get, "LOOKOUT_JPEG_QUALITY", self.jpeg_quality);
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}
