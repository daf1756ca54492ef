use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which face detector backend the daemon loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Scrfd,
    Cascade,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrfd => "scrfd",
            Self::Cascade => "cascade",
        }
    }
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Ok(Self::Scrfd),
            "cascade" => Ok(Self::Cascade),
            other => bail!("unknown detector backend '{other}' (expected scrfd or cascade)"),
        }
    }
}

/// Daemon configuration.
///
/// Resolved in three layers: built-in defaults, then the TOML file named by
/// `FACEGATE_CONFIG` (if set), then individual `FACEGATE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the model files.
    pub model_dir: PathBuf,
    pub detector: DetectorKind,
    /// Votes a cascade cluster needs to count as a face.
    pub min_neighbors: usize,
    /// Euclidean distance below which a descriptor matches.
    pub match_threshold: f32,
    /// Inference worker threads.
    pub workers: usize,
    /// JSON file holding the full enrollment list.
    pub enrollment_file: PathBuf,
}

/// Optional overrides read from the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    detector: Option<DetectorKind>,
    min_neighbors: Option<usize>,
    match_threshold: Option<f32>,
    workers: Option<usize>,
    enrollment_file: Option<PathBuf>,
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    fn resolve(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::defaults(&env);

        if let Some(path) = env("FACEGATE_CONFIG") {
            let file = read_file_config(Path::new(&path))?;
            config.apply_file(file);
        }
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn defaults(env: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            model_dir: PathBuf::from("/usr/share/facegate/models"),
            detector: DetectorKind::Scrfd,
            min_neighbors: facegate_core::CascadeParams::default().min_neighbors,
            match_threshold: facegate_core::DEFAULT_MATCH_THRESHOLD,
            workers: facegate_core::DEFAULT_WORKERS,
            enrollment_file: data_dir.join("enrollments.json"),
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.detector {
            self.detector = v;
        }
        if let Some(v) = file.min_neighbors {
            self.min_neighbors = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.workers {
            self.workers = v;
        }
        if let Some(v) = file.enrollment_file {
            self.enrollment_file = v;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEGATE_DETECTOR") {
            self.detector = v.parse()?;
        }
        if let Some(v) = env("FACEGATE_MIN_NEIGHBORS") {
            self.min_neighbors = parse_var("FACEGATE_MIN_NEIGHBORS", &v)?;
        }
        if let Some(v) = env("FACEGATE_MATCH_THRESHOLD") {
            self.match_threshold = parse_var("FACEGATE_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = env("FACEGATE_WORKERS") {
            self.workers = parse_var("FACEGATE_WORKERS", &v)?;
        }
        if let Some(v) = env("FACEGATE_ENROLLMENT_FILE") {
            self.enrollment_file = PathBuf::from(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            bail!("match threshold must be a positive number, got {}", self.match_threshold);
        }
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.min_neighbors == 0 {
            bail!("min_neighbors must be at least 1");
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path("w600k_r50.onnx")
    }

    /// Path to the SeetaFace cascade model.
    pub fn cascade_model_path(&self) -> String {
        self.model_path("seeta_fd_frontal_v1.0.bin")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("malformed config file {}", path.display()))
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(env_of(&[("HOME", "/home/ada")])).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/usr/share/facegate/models"));
        assert_eq!(config.detector, DetectorKind::Scrfd);
        assert_eq!(config.min_neighbors, 3);
        assert!((config.match_threshold - 1.10).abs() < 1e-6);
        assert_eq!(config.workers, 2);
        assert_eq!(
            config.enrollment_file,
            PathBuf::from("/home/ada/.local/share/facegate/enrollments.json")
        );
        assert_eq!(config.arcface_model_path(), "/usr/share/facegate/models/w600k_r50.onnx");
    }

    #[test]
    fn test_xdg_data_home_wins_over_home() {
        let config = Config::resolve(env_of(&[("HOME", "/home/ada"), ("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.enrollment_file, PathBuf::from("/data/facegate/enrollments.json"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("facegate.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "detector = \"cascade\"\nworkers = 6\nmatch_threshold = 0.9").unwrap();

        let config = Config::resolve(env_of(&[
            ("FACEGATE_CONFIG", path.to_str().unwrap()),
            ("FACEGATE_WORKERS", "3"),
            ("FACEGATE_MODEL_DIR", "/opt/models"),
        ]))
        .unwrap();
        assert_eq!(config.detector, DetectorKind::Cascade);
        assert_eq!(config.workers, 3);
        assert!((config.match_threshold - 0.9).abs() < 1e-6);
        assert_eq!(config.cascade_model_path(), "/opt/models/seeta_fd_frontal_v1.0.bin");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::resolve(env_of(&[("FACEGATE_DETECTOR", "haar")])).is_err());
        assert!(Config::resolve(env_of(&[("FACEGATE_WORKERS", "zero")])).is_err());
        assert!(Config::resolve(env_of(&[("FACEGATE_WORKERS", "0")])).is_err());
        assert!(Config::resolve(env_of(&[("FACEGATE_MATCH_THRESHOLD", "-1")])).is_err());
        assert!(Config::resolve(env_of(&[("FACEGATE_CONFIG", "/nonexistent/facegate.toml")])).is_err());
    }

    #[test]
    fn test_unknown_file_key_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("facegate.toml");
        std::fs::write(&path, "camera = \"/dev/video0\"\n").unwrap();
        assert!(Config::resolve(env_of(&[("FACEGATE_CONFIG", path.to_str().unwrap())])).is_err());
    }

    #[test]
    fn test_detector_kind_parse() {
        assert_eq!("SCRFD".parse::<DetectorKind>().unwrap(), DetectorKind::Scrfd);
        assert_eq!(" cascade ".parse::<DetectorKind>().unwrap(), DetectorKind::Cascade);
    }
}
