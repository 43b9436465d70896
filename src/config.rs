use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model_config::{self, WeightsFormat};
use crate::utils::expand_tilde;

/// Environment variable holding the search path list. The second entry is
/// the models directory.
pub const PATH_LIST_VAR: &str = "MOONDREAM_PATH";

const DEFAULT_PORT: u16 = 3475;
const DEFAULT_MAX_TOKENS: usize = 512;
const DEFAULT_SEED: u64 = 1337;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STREAM_BUFFER: usize = 64;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} environment variable not set")]
    MissingPathList { var: &'static str },

    #[error("{var} should contain both the current directory and the models directory, got {found} path entries")]
    TooFewPathEntries { var: &'static str, found: usize },

    #[error("model file not found at {}", .0.display())]
    WeightsNotFound(PathBuf),

    #[error("unsupported weight file {}: expected .gguf or .safetensors", .0.display())]
    UnsupportedWeights(PathBuf),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Sampling parameters handed to the engine.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_tokens: usize,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: u64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            top_p: None,
            seed: DEFAULT_SEED,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub models_dir: PathBuf,
    pub weights_path: PathBuf,
    pub weights_format: WeightsFormat,
    pub tokenizer_repo: String,
    pub tokenizer_revision: String,
    pub generation: GenerationOptions,
    pub generation_timeout: Duration,
    pub stream_buffer: usize,
    pub max_body_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_list = lookup(PATH_LIST_VAR)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingPathList { var: PATH_LIST_VAR })?;

        let paths: Vec<PathBuf> = std::env::split_paths(&path_list).collect();
        for (i, path) in paths.iter().enumerate() {
            tracing::debug!("{} entry {}: {}", PATH_LIST_VAR, i, path.display());
        }
        if paths.len() < 2 {
            return Err(ConfigError::TooFewPathEntries {
                var: PATH_LIST_VAR,
                found: paths.len(),
            });
        }

        let models_dir = expand_tilde(&paths[1]);
        let weights_name = lookup("MOONDREAM_WEIGHTS")
            .unwrap_or_else(|| model_config::DEFAULT_WEIGHTS_FILE.to_string());
        let weights_path = models_dir.join(weights_name);

        let weights_format = WeightsFormat::from_path(&weights_path)
            .ok_or_else(|| ConfigError::UnsupportedWeights(weights_path.clone()))?;
        if !weights_path.is_file() {
            return Err(ConfigError::WeightsNotFound(weights_path));
        }

        let generation = GenerationOptions {
            max_tokens: parse_var(&lookup, "MOONDREAM_MAX_TOKENS")?.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: parse_var(&lookup, "MOONDREAM_TEMPERATURE")?,
            top_p: parse_var(&lookup, "MOONDREAM_TOP_P")?,
            seed: parse_var(&lookup, "MOONDREAM_SEED")?.unwrap_or(DEFAULT_SEED),
            repeat_penalty: parse_var(&lookup, "MOONDREAM_REPEAT_PENALTY")?.unwrap_or(1.0),
            repeat_last_n: parse_var(&lookup, "MOONDREAM_REPEAT_LAST_N")?.unwrap_or(64),
        };

        let stream_buffer: usize =
            parse_var(&lookup, "MOONDREAM_STREAM_BUFFER")?.unwrap_or(DEFAULT_STREAM_BUFFER);
        if stream_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                var: "MOONDREAM_STREAM_BUFFER",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            host: parse_var(&lookup, "HOST")?.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: parse_var(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT),
            models_dir,
            weights_path,
            weights_format,
            tokenizer_repo: lookup("MOONDREAM_TOKENIZER_REPO")
                .unwrap_or_else(|| model_config::TOKENIZER_REPO.to_string()),
            tokenizer_revision: lookup("MOONDREAM_TOKENIZER_REVISION")
                .unwrap_or_else(|| model_config::TOKENIZER_REVISION.to_string()),
            generation,
            generation_timeout: Duration::from_secs(
                parse_var(&lookup, "MOONDREAM_TIMEOUT_SECS")?.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            stream_buffer,
            max_body_size: parse_var(&lookup, "MOONDREAM_MAX_BODY_BYTES")?
                .unwrap_or(DEFAULT_MAX_BODY_BYTES),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn models_dir_with(file: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(file), b"weights").unwrap();
        dir
    }

    fn path_list(models: &std::path::Path) -> String {
        std::env::join_paths([PathBuf::from("."), models.to_path_buf()])
            .unwrap()
            .into_string()
            .unwrap()
    }

    fn lookup_from(vars: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn missing_path_list_is_rejected() {
        let err = Config::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPathList { .. }));
    }

    #[test]
    fn single_path_entry_is_rejected() {
        let vars = HashMap::from([(PATH_LIST_VAR, ".".to_string())]);
        let err = Config::from_lookup(lookup_from(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::TooFewPathEntries { found: 1, .. }));
    }

    #[test]
    fn missing_weight_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::from([(PATH_LIST_VAR, path_list(dir.path()))]);
        let err = Config::from_lookup(lookup_from(vars)).unwrap_err();
        match err {
            ConfigError::WeightsNotFound(path) => {
                assert_eq!(path, dir.path().join(model_config::DEFAULT_WEIGHTS_FILE));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_weight_extension_is_rejected() {
        let dir = models_dir_with("moondream-2b-int8.mf.gz");
        let vars = HashMap::from([
            (PATH_LIST_VAR, path_list(dir.path())),
            ("MOONDREAM_WEIGHTS", "moondream-2b-int8.mf.gz".to_string()),
        ]);
        let err = Config::from_lookup(lookup_from(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedWeights(_)));
    }

    #[test]
    fn defaults_are_applied() {
        let dir = models_dir_with(model_config::DEFAULT_WEIGHTS_FILE);
        let vars = HashMap::from([(PATH_LIST_VAR, path_list(dir.path()))]);
        let config = Config::from_lookup(lookup_from(vars)).unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:3475".parse().unwrap());
        assert_eq!(config.models_dir, dir.path());
        assert_eq!(config.weights_format, WeightsFormat::Gguf);
        assert_eq!(config.generation.max_tokens, 512);
        assert!(config.generation.temperature.is_none());
        assert_eq!(config.generation_timeout, Duration::from_secs(300));
        assert_eq!(config.stream_buffer, 64);
        assert_eq!(config.tokenizer_repo, "vikhyatk/moondream2");
    }

    #[test]
    fn overrides_are_parsed() {
        let dir = models_dir_with("model.safetensors");
        let vars = HashMap::from([
            (PATH_LIST_VAR, path_list(dir.path())),
            ("MOONDREAM_WEIGHTS", "model.safetensors".to_string()),
            ("PORT", "8080".to_string()),
            ("MOONDREAM_TEMPERATURE", "0.7".to_string()),
            ("MOONDREAM_TIMEOUT_SECS", "5".to_string()),
        ]);
        let config = Config::from_lookup(lookup_from(vars)).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.weights_format, WeightsFormat::Safetensors);
        assert_eq!(config.generation.temperature, Some(0.7));
        assert_eq!(config.generation_timeout, Duration::from_secs(5));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let dir = models_dir_with(model_config::DEFAULT_WEIGHTS_FILE);
        let vars = HashMap::from([
            (PATH_LIST_VAR, path_list(dir.path())),
            ("PORT", "eighty".to_string()),
        ]);
        let err = Config::from_lookup(lookup_from(vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "PORT", .. }));
    }

    #[test]
    fn zero_stream_buffer_is_rejected() {
        let dir = models_dir_with(model_config::DEFAULT_WEIGHTS_FILE);
        let vars = HashMap::from([
            (PATH_LIST_VAR, path_list(dir.path())),
            ("MOONDREAM_STREAM_BUFFER", "0".to_string()),
        ]);
        let err = Config::from_lookup(lookup_from(vars)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "MOONDREAM_STREAM_BUFFER", .. }
        ));
    }
}
