use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use vigil_core::debounce::DebounceConfig;
use vigil_core::forest::ForestConfig;
use vigil_core::resolver::{DistanceAveraging, ResolverConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `VIGIL_CONFIG` (if any),
/// then `VIGIL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Frame source: `/dev/videoN` for V4L2, otherwise an MJPEG stream URL.
    pub source: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Face detector model; defaults to `<model_dir>/face_detector.onnx`.
    pub detector_model: Option<PathBuf>,
    /// Face embedder model; defaults to `<model_dir>/face_embedder.onnx`.
    pub embedder_model: Option<PathBuf>,
    pub catalog_url: String,
    pub upload_url: String,
    pub mqtt_url: String,
    pub mqtt_topic: String,
    /// Where captured frames are written.
    pub captured_dir: PathBuf,
    /// Persisted identity index.
    pub index_path: PathBuf,
    /// Listen address of the live video feed.
    pub feed_addr: String,
    /// Embedding dimension expected from catalog and embedder.
    pub dimension: usize,
    pub n_trees: usize,
    /// Neighbours consulted per identification.
    pub k: usize,
    /// Maximum accepted average angular distance.
    pub distance_threshold: f32,
    pub distance_averaging: DistanceAveraging,
    /// Seconds a face must stay in view before capture.
    pub stable_secs: f32,
    /// Minimum seconds between captures.
    pub cooldown_secs: f32,
    /// Upper bound on one identification job.
    pub job_timeout_secs: u64,
    /// Catalog re-fetch period; 0 disables periodic refresh.
    pub refresh_interval_secs: u64,
    /// Pixels added around each face box on the video feed.
    pub box_padding: u32,
    pub detector_confidence: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "http://127.0.0.1:81/stream".to_string(),
            model_dir: PathBuf::from("models"),
            detector_model: None,
            embedder_model: None,
            catalog_url: "http://127.0.0.1:8081/getAllDataWithUsername".to_string(),
            upload_url: "http://127.0.0.1:8081/createhistories".to_string(),
            mqtt_url: "mqtt://127.0.0.1:1883".to_string(),
            mqtt_topic: "esp32/data".to_string(),
            captured_dir: PathBuf::from("captured_folder"),
            index_path: PathBuf::from("identity.vidx"),
            feed_addr: "0.0.0.0:9999".to_string(),
            dimension: 128,
            n_trees: 50,
            k: 10,
            distance_threshold: 0.36,
            distance_averaging: DistanceAveraging::AllNeighbors,
            stable_secs: 3.0,
            cooldown_secs: 8.0,
            job_timeout_secs: 30,
            refresh_interval_secs: 0,
            box_padding: 30,
            detector_confidence: 0.7,
        }
    }
}

impl Config {
    /// Load from `$VIGIL_CONFIG` (optional) and `VIGIL_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("VIGIL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from environment-style lookups. Unparseable values
    /// are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("VIGIL_SOURCE") {
            self.source = v;
        }
        if let Some(v) = var("VIGIL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_DETECTOR_MODEL") {
            self.detector_model = Some(PathBuf::from(v));
        }
        if let Some(v) = var("VIGIL_EMBEDDER_MODEL") {
            self.embedder_model = Some(PathBuf::from(v));
        }
        if let Some(v) = var("VIGIL_CATALOG_URL") {
            self.catalog_url = v;
        }
        if let Some(v) = var("VIGIL_UPLOAD_URL") {
            self.upload_url = v;
        }
        if let Some(v) = var("VIGIL_MQTT_URL") {
            self.mqtt_url = v;
        }
        if let Some(v) = var("VIGIL_MQTT_TOPIC") {
            self.mqtt_topic = v;
        }
        if let Some(v) = var("VIGIL_CAPTURED_DIR") {
            self.captured_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_INDEX_PATH") {
            self.index_path = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_FEED_ADDR") {
            self.feed_addr = v;
        }
        if let Some(v) = var("VIGIL_DISTANCE_AVERAGING") {
            match v.as_str() {
                "all_neighbors" => self.distance_averaging = DistanceAveraging::AllNeighbors,
                "majority_only" => self.distance_averaging = DistanceAveraging::MajorityOnly,
                other => tracing::warn!(value = other, "ignoring unknown VIGIL_DISTANCE_AVERAGING"),
            }
        }

        env_parse(&var, "VIGIL_DIMENSION", &mut self.dimension);
        env_parse(&var, "VIGIL_N_TREES", &mut self.n_trees);
        env_parse(&var, "VIGIL_K", &mut self.k);
        env_parse(&var, "VIGIL_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        env_parse(&var, "VIGIL_STABLE_SECS", &mut self.stable_secs);
        env_parse(&var, "VIGIL_COOLDOWN_SECS", &mut self.cooldown_secs);
        env_parse(&var, "VIGIL_JOB_TIMEOUT_SECS", &mut self.job_timeout_secs);
        env_parse(&var, "VIGIL_REFRESH_INTERVAL_SECS", &mut self.refresh_interval_secs);
        env_parse(&var, "VIGIL_BOX_PADDING", &mut self.box_padding);
        env_parse(&var, "VIGIL_DETECTOR_CONFIDENCE", &mut self.detector_confidence);
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.detector_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join("face_detector.onnx"))
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.embedder_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join("face_embedder.onnx"))
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            stable_duration: secs_f32(self.stable_secs),
            cooldown: secs_f32(self.cooldown_secs),
        }
    }

    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            k: self.k,
            distance_threshold: self.distance_threshold,
            averaging: self.distance_averaging,
            search_k: None,
        }
    }

    pub fn forest(&self) -> ForestConfig {
        ForestConfig {
            n_trees: self.n_trees,
            ..ForestConfig::default()
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// `None` when periodic refresh is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn secs_f32(secs: f32) -> Duration {
    Duration::try_from_secs_f32(secs.max(0.0)).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.k, 10);
        assert_eq!(config.n_trees, 50);
        assert_eq!(config.distance_threshold, 0.36);
        assert_eq!(config.mqtt_topic, "esp32/data");
        assert_eq!(config.debounce().stable_duration, Duration::from_secs(3));
        assert_eq!(config.debounce().cooldown, Duration::from_secs(8));
        assert_eq!(config.refresh_interval(), None);
        assert_eq!(config.detector_model_path(), PathBuf::from("models/face_detector.onnx"));
    }

    #[test]
    fn test_toml_overrides_only_named_fields() {
        let config = Config::from_toml_str(
            r#"
            source = "/dev/video2"
            k = 5
            distance_averaging = "majority_only"
            embedder_model = "/opt/embed.onnx"
            "#,
        )
        .unwrap();
        assert_eq!(config.source, "/dev/video2");
        assert_eq!(config.k, 5);
        assert_eq!(config.distance_averaging, DistanceAveraging::MajorityOnly);
        assert_eq!(config.embedder_model_path(), PathBuf::from("/opt/embed.onnx"));
        assert_eq!(config.n_trees, 50);
    }

    #[test]
    fn test_toml_rejects_wrong_types() {
        assert!(matches!(Config::from_toml_str("k = \"ten\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::from_toml_str("k = 5\nstable_secs = 1.0").unwrap();
        config.apply_env(lookup(&[
            ("VIGIL_K", "7"),
            ("VIGIL_STABLE_SECS", "2.5"),
            ("VIGIL_MQTT_TOPIC", "door/1"),
            ("VIGIL_REFRESH_INTERVAL_SECS", "600"),
        ]));
        assert_eq!(config.k, 7);
        assert_eq!(config.debounce().stable_duration, Duration::from_millis(2500));
        assert_eq!(config.mqtt_topic, "door/1");
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("VIGIL_K", "many"),
            ("VIGIL_DISTANCE_THRESHOLD", ""),
            ("VIGIL_DISTANCE_AVERAGING", "median"),
        ]));
        assert_eq!(config.k, 10);
        assert_eq!(config.distance_threshold, 0.36);
        assert_eq!(config.distance_averaging, DistanceAveraging::AllNeighbors);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
