// THEORY:
// The kiosk is configured by a small JSON file, normally deployed next to the
// binary on the display device. Only the four values that differ per site are
// required; everything else has a default matching a stock Raspberry Pi kiosk.
// The file is validated once at startup so that a typo fails loudly instead of
// turning into an endless reconnect loop.

use crate::core_modules::display_state::DEFAULT_BLANK_AFTER;
use crate::core_modules::multipart::DEFAULT_STALL_TIMEOUT;
use crate::core_modules::reconnect::DEFAULT_BACKOFF;
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct KioskConfig {
    /// Display width in pixels.
    pub width: u32,
    /// Display height in pixels.
    pub height: u32,
    /// MJPEG stream endpoint (`http://` or `https://`).
    pub mjpeg_url: String,
    /// Motion notification websocket (`ws://` or `wss://`).
    pub notify_url: String,

    #[serde(default = "default_blank_after_secs")]
    pub blank_after_secs: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Program and arguments run once per notification. Empty disables alerts.
    #[serde(default = "default_alert_command")]
    pub alert_command: Vec<String>,
    /// Turn off X11 screen saver and DPMS at startup.
    #[serde(default = "default_disable_blanking")]
    pub disable_blanking: bool,
    #[serde(default = "default_x_display")]
    pub x_display: String,
}

fn default_blank_after_secs() -> u64 {
    DEFAULT_BLANK_AFTER.as_secs()
}

fn default_reconnect_backoff_ms() -> u64 {
    DEFAULT_BACKOFF.as_millis() as u64
}

fn default_stall_timeout_secs() -> u64 {
    DEFAULT_STALL_TIMEOUT.as_secs()
}

fn default_alert_command() -> Vec<String> {
    vec!["/usr/bin/aplay".into(), "/home/pi/motion.wav".into()]
}

fn default_disable_blanking() -> bool {
    true
}

fn default_x_display() -> String {
    ":0".into()
}

impl KioskConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "display size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        require_scheme("mjpeg_url", &self.mjpeg_url, &["http://", "https://"])?;
        require_scheme("notify_url", &self.notify_url, &["ws://", "wss://"])?;
        if self.blank_after_secs == 0 {
            return Err(ConfigError::Invalid("blank_after_secs must be positive".into()));
        }
        if self.reconnect_backoff_ms == 0 {
            return Err(ConfigError::Invalid("reconnect_backoff_ms must be positive".into()));
        }
        if self.stall_timeout_secs == 0 {
            return Err(ConfigError::Invalid("stall_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn blank_after(&self) -> Duration {
        Duration::from_secs(self.blank_after_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

fn require_scheme(key: &str, url: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let lower = url.to_ascii_lowercase();
    let ok = schemes
        .iter()
        .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len());
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{key} must start with {}, got {url:?}",
            schemes.join(" or ")
        )))
    }
}
