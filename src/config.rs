use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{buffer::SegmentBuffer, errors::DaclError};

const CONFIG_DIR_NAME: &str = "dacl";
const CONFIG_FILE_NAME: &str = "config.ini";
const FALLBACK_CONFIG_PATH: &str = "configs/config.ini";

/// Runtime settings, loaded from a `key=value` file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub segment_seconds: u64,
    pub buffer_minutes: u64,
    pub pretrigger_minutes: u64,
    pub posttrigger_minutes: u64,
    pub buffer_dir: PathBuf,
    pub event_dir: PathBuf,
    pub can_iface: String,
    /// `id,label` pairs separated by `;`
    pub warning_ids: String,
    pub button_pin: u32,
    /// Defaults to `buffer_minutes + 2`
    pub retention_minutes: Option<u64>,
    pub sweep_interval_seconds: u64,
    pub purge_on_start: bool,
    pub encoder_program: String,
    pub video_width: u32,
    pub video_height: u32,
    pub framerate: u32,
    pub burn_in_overlay: bool,
    pub ffmpeg_program: String,
    pub audit_log: PathBuf,
    /// Defaults to the post-trigger window plus two segments
    pub session_timeout_seconds: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_seconds: 60,
            buffer_minutes: 10,
            pretrigger_minutes: 5,
            posttrigger_minutes: 5,
            buffer_dir: PathBuf::from("/tmp/dacl_buffer"),
            event_dir: PathBuf::from("/tmp/dacl_events"),
            can_iface: "can0".to_string(),
            warning_ids: String::new(),
            button_pin: 0,
            retention_minutes: None,
            sweep_interval_seconds: 60,
            purge_on_start: true,
            encoder_program: "libcamera-vid".to_string(),
            video_width: 1456,
            video_height: 1088,
            framerate: 15,
            burn_in_overlay: true,
            ffmpeg_program: "ffmpeg".to_string(),
            audit_log: PathBuf::from("logs/events.csv"),
            session_timeout_seconds: None,
        }
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> DaclError {
    DaclError::InvalidConfigValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, DaclError> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "not a non-negative integer"))
}

fn minutes_as_secs(key: &str, minutes: u64) -> Result<u64, DaclError> {
    minutes
        .checked_mul(60)
        .ok_or_else(|| invalid(key, &minutes.to_string(), "too large"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DaclError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}

impl Config {
    /// Parses `key=value` lines. Blank lines, `#`/`;` comments and `[section]` headers are
    /// ignored; unknown keys are logged and ignored.
    pub fn parse(text: &str) -> Result<Self, DaclError> {
        let mut config = Config::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with(';')
                || (line.starts_with('[') && line.ends_with(']'))
            {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("Ignoring config line {}: {:?}", number + 1, line);
                continue;
            };
            config.set(key.trim(), value.trim())?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), DaclError> {
        match key {
            "segment_seconds" => self.segment_seconds = parse_number(key, value)?,
            "buffer_minutes" => self.buffer_minutes = parse_number(key, value)?,
            "pretrigger_minutes" => self.pretrigger_minutes = parse_number(key, value)?,
            "posttrigger_minutes" => self.posttrigger_minutes = parse_number(key, value)?,
            "buffer_dir" => self.buffer_dir = PathBuf::from(value),
            "event_dir" => self.event_dir = PathBuf::from(value),
            "can_iface" => self.can_iface = value.to_string(),
            "warning_ids" => self.warning_ids = value.to_string(),
            "button_pin" => self.button_pin = parse_number(key, value)?,
            "retention_minutes" => self.retention_minutes = Some(parse_number(key, value)?),
            "sweep_interval_seconds" => self.sweep_interval_seconds = parse_number(key, value)?,
            "purge_on_start" => self.purge_on_start = parse_bool(key, value)?,
            "encoder_program" => self.encoder_program = value.to_string(),
            "video_width" => self.video_width = parse_number(key, value)?,
            "video_height" => self.video_height = parse_number(key, value)?,
            "framerate" => self.framerate = parse_number(key, value)?,
            "burn_in_overlay" => self.burn_in_overlay = parse_bool(key, value)?,
            "ffmpeg_program" => self.ffmpeg_program = value.to_string(),
            "audit_log" => self.audit_log = PathBuf::from(value),
            "session_timeout_seconds" => {
                self.session_timeout_seconds = Some(parse_number(key, value)?)
            }
            _ => warn!("Ignoring unknown config key {:?}", key),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DaclError> {
        let positive = [
            ("segment_seconds", self.segment_seconds),
            ("buffer_minutes", self.buffer_minutes),
            ("sweep_interval_seconds", self.sweep_interval_seconds),
            ("video_width", u64::from(self.video_width)),
            ("video_height", u64::from(self.video_height)),
            ("framerate", u64::from(self.framerate)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "0", "must be greater than zero"));
            }
        }
        let buffer_secs = minutes_as_secs("buffer_minutes", self.buffer_minutes)?;
        minutes_as_secs("pretrigger_minutes", self.pretrigger_minutes)?;
        let post_secs = minutes_as_secs("posttrigger_minutes", self.posttrigger_minutes)?;
        if let Some(retention) = self.retention_minutes {
            minutes_as_secs("retention_minutes", retention)?;
        } else {
            minutes_as_secs("buffer_minutes", self.buffer_minutes.saturating_add(2))?;
        }
        if self.session_timeout_seconds.is_none()
            && self
                .segment_seconds
                .checked_mul(2)
                .and_then(|segments| segments.checked_add(post_secs))
                .is_none()
        {
            return Err(invalid(
                "posttrigger_minutes",
                &self.posttrigger_minutes.to_string(),
                "too large",
            ));
        }
        if self.pretrigger_minutes > self.buffer_minutes {
            return Err(invalid(
                "pretrigger_minutes",
                &self.pretrigger_minutes.to_string(),
                "pre-trigger window is longer than the buffer",
            ));
        }
        if self.segment_seconds > buffer_secs {
            return Err(invalid(
                "segment_seconds",
                &self.segment_seconds.to_string(),
                "a segment is longer than the buffer",
            ));
        }
        if let Some(retention) = self.retention_minutes
            && retention < self.buffer_minutes
        {
            warn!(
                "retention_minutes ({}) is shorter than buffer_minutes ({}), buffered files are protected from the sweep",
                retention, self.buffer_minutes
            );
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, DaclError> {
        let text = fs::read_to_string(path).map_err(|e| DaclError::ConfigIOError {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!("Loaded config from {}", path.display());
        Self::parse(&text)
    }

    /// `<config dir>/dacl/config.ini` when it exists, `configs/config.ini` otherwise.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_PATH))
    }

    /// Loads `path` if given. Without a path the default location is tried and the
    /// built-in defaults are used when nothing is there.
    pub fn load(path: Option<&Path>) -> Result<Self, DaclError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    info!("No config file at {}, using defaults", path.display());
                    let config = Config::default();
                    config.validate()?;
                    Ok(config)
                }
            }
        }
    }

    pub fn to_json(&self) -> Result<String, DaclError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DaclError::ConfigSerializeError { source: e })
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_seconds)
    }

    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs(self.buffer_minutes.saturating_mul(60))
    }

    pub fn buffer_capacity(&self) -> usize {
        SegmentBuffer::capacity_for(self.buffer_duration(), self.segment_duration())
    }

    pub fn pre_window(&self) -> Duration {
        Duration::from_secs(self.pretrigger_minutes.saturating_mul(60))
    }

    pub fn post_window(&self) -> Duration {
        Duration::from_secs(self.posttrigger_minutes.saturating_mul(60))
    }

    pub fn retention_age(&self) -> Duration {
        Duration::from_secs(
            self.retention_minutes
                .unwrap_or(self.buffer_minutes.saturating_add(2))
                .saturating_mul(60),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn session_timeout(&self) -> Duration {
        match self.session_timeout_seconds {
            Some(seconds) => Duration::from_secs(seconds),
            None => self
                .post_window()
                .saturating_add(self.segment_duration().saturating_mul(2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.buffer_capacity(), 10);
        assert_eq!(config.pre_window(), Duration::from_secs(300));
        assert_eq!(config.retention_age(), Duration::from_secs(12 * 60));
        assert_eq!(config.session_timeout(), Duration::from_secs(300 + 120));
        assert_eq!(config.can_iface, "can0");
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse(
            "# recorder settings\n\
             [recorder]\n\
             segment_seconds = 30\n\
             buffer_minutes=20\n\
             ; comment\n\
             warning_ids=0x1A1,EngineFault;0x3F3,BrakeWarn\n\
             burn_in_overlay = no\n\
             retention_minutes=30\n\
             mystery=1\n",
        )
        .unwrap();

        assert_eq!(config.segment_seconds, 30);
        assert_eq!(config.buffer_capacity(), 40);
        assert_eq!(config.warning_ids, "0x1A1,EngineFault;0x3F3,BrakeWarn");
        assert!(!config.burn_in_overlay);
        assert_eq!(config.retention_age(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_invalid_numbers_are_fatal() {
        for text in [
            "segment_seconds=abc",
            "buffer_minutes=-1",
            "segment_seconds=0",
            "purge_on_start=maybe",
            "pretrigger_minutes=11",
            "buffer_minutes=18446744073709551615",
            "posttrigger_minutes=307445734561825861",
            "retention_minutes=307445734561825861",
        ] {
            let err = Config::parse(text).unwrap_err();
            assert!(err.is_fatal(), "{text} should be fatal");
            assert!(matches!(err, DaclError::InvalidConfigValue { .. }));
        }
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.ini");
        fs::write(&path, "can_iface=vcan0\nbutton_pin=17\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.can_iface, "vcan0");
        assert_eq!(config.button_pin, 17);

        assert!(matches!(
            Config::from_file(&dir.path().join("missing.ini")),
            Err(DaclError::ConfigIOError { .. })
        ));
    }

    #[test]
    fn test_json_output() {
        let json = Config::default().to_json().unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
