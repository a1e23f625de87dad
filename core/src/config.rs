//! Runtime configuration
//!
//! [`FusionConfig`] gathers every tunable of the fusion pipeline. It is plain serde data with a
//! default for every field, so partial files are accepted, and it is read from / written to
//! JSON, YAML or TOML depending on the file extension.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kalman::CovarianceUpdate;
use crate::model::InitialCovariance;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("toml write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(Option<String>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Storage of the Kalman filter matrices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Compile-time sized, stack allocated.
    #[default]
    Fixed,
    /// Runtime sized, heap allocated.
    Dynamic,
}

/// Units of the published course over ground.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseUnits {
    #[default]
    Radians,
    Degrees,
}

/// Units of the published speed over ground.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnits {
    #[default]
    MetersPerSecond,
    Knots,
}

fn default_sample_time_ms() -> u64 {
    100
}
fn default_process_noise_std() -> f64 {
    0.1
}
fn default_interval_ms() -> u64 {
    200
}
fn default_drift_speed_threshold() -> f64 {
    0.5
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "sailtrack-kalman".to_string()
}
fn default_keep_alive_s() -> u64 {
    15
}
fn default_gps_topic() -> String {
    "sensor/gps0".to_string()
}
fn default_imu_topic() -> String {
    "sensor/imu0".to_string()
}
fn default_output_topic() -> String {
    "boat".to_string()
}

/// Kalman filter settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter loop period (ms), also the model sample time.
    #[serde(default = "default_sample_time_ms")]
    pub sample_time_ms: u64,
    /// Acceleration noise standard deviation (m/s²).
    #[serde(default = "default_process_noise_std")]
    pub process_noise_std: f64,
    #[serde(default)]
    pub initial_covariance: InitialCovariance,
    #[serde(default)]
    pub representation: Representation,
    #[serde(default)]
    pub covariance_update: CovarianceUpdate,
    /// Minimum GPS fix type accepted when the receiver reports one.
    #[serde(default)]
    pub min_fix_type: i32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            sample_time_ms: default_sample_time_ms(),
            process_noise_std: default_process_noise_std(),
            initial_covariance: InitialCovariance::default(),
            representation: Representation::default(),
            covariance_update: CovarianceUpdate::default(),
            min_fix_type: 0,
        }
    }
}

impl FilterConfig {
    pub fn sample_time(&self) -> Duration {
        Duration::from_millis(self.sample_time_ms)
    }
}

/// Output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Publish loop period (ms).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Speed over ground (m/s) below which drift is reported as zero.
    #[serde(default = "default_drift_speed_threshold")]
    pub drift_speed_threshold: f64,
    #[serde(default)]
    pub course_units: CourseUnits,
    #[serde(default)]
    pub speed_units: SpeedUnits,
}

impl Default for PublishConfig {
    fn default() -> Self {
        PublishConfig {
            interval_ms: default_interval_ms(),
            drift_speed_threshold: default_drift_speed_threshold(),
            course_units: CourseUnits::default(),
            speed_units: SpeedUnits::default(),
        }
    }
}

impl PublishConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Broker connection and topics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    #[serde(default = "default_gps_topic")]
    pub gps_topic: String,
    #[serde(default = "default_imu_topic")]
    pub imu_topic: String,
    #[serde(default = "default_output_topic")]
    pub output_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_s: default_keep_alive_s(),
            gps_topic: default_gps_topic(),
            imu_topic: default_imu_topic(),
            output_topic: default_output_topic(),
        }
    }
}

/// Complete configuration of the fusion pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

impl FusionConfig {
    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.filter.sample_time_ms == 0 {
            return invalid("filter.sample_time_ms must be positive".into());
        }
        if !(self.filter.process_noise_std.is_finite() && self.filter.process_noise_std >= 0.0) {
            return invalid(format!(
                "filter.process_noise_std must be finite and non-negative, got {}",
                self.filter.process_noise_std
            ));
        }
        if self.publish.interval_ms == 0 {
            return invalid("publish.interval_ms must be positive".into());
        }
        if self.publish.interval_ms < self.filter.sample_time_ms {
            return invalid(format!(
                "publish.interval_ms ({}) is shorter than filter.sample_time_ms ({})",
                self.publish.interval_ms, self.filter.sample_time_ms
            ));
        }
        if !(self.publish.drift_speed_threshold.is_finite() && self.publish.drift_speed_threshold >= 0.0)
        {
            return invalid(format!(
                "publish.drift_speed_threshold must be finite and non-negative, got {}",
                self.publish.drift_speed_threshold
            ));
        }
        if self.mqtt.host.is_empty() {
            return invalid("mqtt.host must not be empty".into());
        }
        Ok(())
    }

    /// Encode the configuration in `format`.
    pub fn encode(&self, format: ConfigFormat) -> Result<String, ConfigError> {
        Ok(match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        })
    }

    /// Decode a configuration document. Missing fields take their defaults; the result is not
    /// validated, since command line overrides are usually applied first.
    pub fn decode(format: ConfigFormat, text: &str) -> Result<Self, ConfigError> {
        Ok(match format {
            ConfigFormat::Json => serde_json::from_str(text)?,
            ConfigFormat::Yaml => serde_yaml::from_str(text)?,
            ConfigFormat::Toml => toml::from_str(text)?,
        })
    }

    /// Write the configuration, in the format named by the file extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.encode(ConfigFormat::from_path(path)?)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Read a configuration file, in the format named by its extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        Self::decode(format, &fs::read_to_string(path)?)
    }
}

/// On-disk configuration formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// `.json`, `.yaml`/`.yml` or `.toml`, case-insensitive.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(ConfigError::UnsupportedExtension(extension)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_cfg() -> FusionConfig {
        FusionConfig {
            filter: FilterConfig {
                sample_time_ms: 50,
                process_noise_std: 0.2,
                initial_covariance: InitialCovariance::ProcessNoise,
                representation: Representation::Dynamic,
                covariance_update: CovarianceUpdate::Joseph,
                min_fix_type: 3,
            },
            publish: PublishConfig {
                interval_ms: 250,
                drift_speed_threshold: 0.8,
                course_units: CourseUnits::Degrees,
                speed_units: SpeedUnits::Knots,
            },
            mqtt: MqttConfig {
                username: Some("mqtt".into()),
                password: Some("secret".into()),
                ..MqttConfig::default()
            },
        }
    }

    #[test]
    fn defaults() {
        let cfg = FusionConfig::default();
        assert_eq!(cfg.filter.sample_time(), Duration::from_millis(100));
        assert_eq!(cfg.publish.interval(), Duration::from_millis(200));
        assert_eq!(cfg.publish.drift_speed_threshold, 0.5);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.gps_topic, "sensor/gps0");
        assert_eq!(cfg.mqtt.imu_topic, "sensor/imu0");
        assert_eq!(cfg.mqtt.output_topic, "boat");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_documents_use_defaults() {
        let cfg: FusionConfig =
            serde_json::from_str(r#"{"filter": {"covariance_update": "joseph"}}"#).unwrap();
        assert_eq!(cfg.filter.covariance_update, CovarianceUpdate::Joseph);
        assert_eq!(cfg.filter.sample_time_ms, 100);
        assert_eq!(cfg.publish, PublishConfig::default());
        let cfg: FusionConfig = toml::from_str("[publish]\nspeed_units = \"knots\"\n").unwrap();
        assert_eq!(cfg.publish.speed_units, SpeedUnits::Knots);
        assert_eq!(cfg.mqtt, MqttConfig::default());
    }

    #[test]
    fn string_roundtrip() {
        let cfg = sample_cfg();
        for format in [ConfigFormat::Json, ConfigFormat::Yaml, ConfigFormat::Toml] {
            let text = cfg.encode(format).unwrap();
            assert_eq!(FusionConfig::decode(format, &text).unwrap(), cfg, "{format:?}");
        }
        assert!(matches!(
            FusionConfig::decode(ConfigFormat::Toml, "filter = 3"),
            Err(ConfigError::TomlDe(_))
        ));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.YML")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("dir/a.json")).unwrap(), ConfigFormat::Json);
        assert!(matches!(
            ConfigFormat::from_path(Path::new("config")),
            Err(ConfigError::UnsupportedExtension(None))
        ));
    }

    #[test]
    fn generic_dispatch_roundtrip() {
        let cfg = sample_cfg();
        for ext in ["json", "yaml", "yml", "toml", "TOML"] {
            let f = NamedTempFile::new().unwrap();
            let path = f.path().with_extension(ext);
            cfg.to_file(&path).unwrap();
            assert_eq!(FusionConfig::from_file(&path).unwrap(), cfg, "extension {ext}");
        }
    }

    #[test]
    fn unsupported_extension_error() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("txt");
        assert!(matches!(
            cfg.to_file(&path),
            Err(ConfigError::UnsupportedExtension(Some(ext))) if ext == "txt"
        ));
        assert!(matches!(
            FusionConfig::from_file(&path),
            Err(ConfigError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn validation() {
        let mut cfg = FusionConfig::default();
        cfg.filter.sample_time_ms = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = FusionConfig::default();
        cfg.publish.interval_ms = 50;
        assert!(cfg.validate().is_err());

        let mut cfg = FusionConfig::default();
        cfg.filter.process_noise_std = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = FusionConfig::default();
        cfg.publish.drift_speed_threshold = f64::NAN;
        assert!(cfg.validate().is_err());

        assert!(sample_cfg().validate().is_ok());
    }
}
