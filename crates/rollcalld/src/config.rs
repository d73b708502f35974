use rollcall_core::decoder::{DecoderConfig, DetectionMode};
use rollcall_core::{DetectorConfig, MatcherKind};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Which strategy decides whether a probe matches an enrolled identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatcherChoice {
    Cosine,
    NearestSample,
}

impl FromStr for MatcherChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "nearest-sample" => Ok(Self::NearestSample),
            other => Err(format!("unknown matcher {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub matcher: MatcherChoice,
    /// Cosine similarity a match must exceed.
    pub match_threshold: f32,
    /// Euclidean distance a nearest sample must stay under.
    pub max_distance: f32,
    /// Minimum face score for a detection candidate.
    pub detection_threshold: f32,
    pub nms_threshold: f32,
    /// Recognize every face in a frame instead of only the best one.
    pub multi_face: bool,
    /// Number of engine worker threads.
    pub workers: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    pub bus: BusKind,
    /// Check for an existing mark before attempting the insert.
    pub fast_path: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            matcher: MatcherChoice::Cosine,
            match_threshold: 0.60,
            max_distance: 0.9,
            detection_threshold: 0.6,
            nms_threshold: 0.4,
            multi_face: false,
            workers: 2,
            intra_threads: 1,
            bus: BusKind::Session,
            fast_path: true,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "ROLLCALL_MATCHER", &mut self.matcher);
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_MAX_DISTANCE", &mut self.max_distance);
        override_parsed(&lookup, "ROLLCALL_DETECTION_THRESHOLD", &mut self.detection_threshold);
        override_parsed(&lookup, "ROLLCALL_NMS_THRESHOLD", &mut self.nms_threshold);
        override_parsed(&lookup, "ROLLCALL_WORKERS", &mut self.workers);
        override_parsed(&lookup, "ROLLCALL_INTRA_THREADS", &mut self.intra_threads);
        override_parsed(&lookup, "ROLLCALL_BUS", &mut self.bus);
        if let Some(v) = lookup("ROLLCALL_MULTI_FACE") {
            self.multi_face = env_flag(&v);
        }
        if let Some(v) = lookup("ROLLCALL_FAST_PATH") {
            self.fast_path = env_flag(&v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold {} outside [-1, 1]",
                self.match_threshold
            )));
        }
        if !(self.max_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "max_distance {} must be positive",
                self.max_distance
            )));
        }
        for (name, value) in [
            ("detection_threshold", self.detection_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} {value} outside [0, 1]")));
            }
        }
        Ok(())
    }

    /// Path to the RetinaFace detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("retinaface-resnet50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn matcher_kind(&self) -> MatcherKind {
        match self.matcher {
            MatcherChoice::Cosine => MatcherKind::Cosine {
                threshold: self.match_threshold,
            },
            MatcherChoice::NearestSample => MatcherKind::NearestSample {
                max_distance: self.max_distance,
            },
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            decoder: DecoderConfig {
                confidence_threshold: self.detection_threshold,
                nms_threshold: self.nms_threshold,
                mode: if self.multi_face {
                    DetectionMode::Multi
                } else {
                    DetectionMode::Single
                },
                ..DecoderConfig::default()
            },
            ..DetectorConfig::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *field = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}

fn env_flag(v: &str) -> bool {
    !matches!(v, "0" | "false" | "no" | "off")
}
