//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value was parsed but is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Container extension used for encoded outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputContainer {
    #[default]
    Mp4,
    Mkv,
}

impl OutputContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputContainer::Mp4 => "mp4",
            OutputContainer::Mkv => "mkv",
        }
    }
}

impl fmt::Display for OutputContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputContainer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mp4" => Ok(OutputContainer::Mp4),
            "mkv" => Ok(OutputContainer::Mkv),
            other => Err(format!("unknown output container '{}'", other)),
        }
    }
}

/// How subtitles are carried into the encoded output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleMode {
    /// Whatever the HandBrake preset does
    Preset,
    /// Embed all tracks, none selected by default
    Soft,
    /// Extract tracks to sidecar files next to the output
    #[default]
    External,
    /// Drop subtitles
    None,
}

impl fmt::Display for SubtitleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubtitleMode::Preset => "preset",
            SubtitleMode::Soft => "soft",
            SubtitleMode::External => "external",
            SubtitleMode::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtitleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "preset" => Ok(SubtitleMode::Preset),
            "soft" => Ok(SubtitleMode::Soft),
            "external" => Ok(SubtitleMode::External),
            "none" => Ok(SubtitleMode::None),
            other => Err(format!("unknown subtitle mode '{}'", other)),
        }
    }
}

/// Optical media type, used to size the MakeMKV read cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscType {
    #[default]
    Dvd,
    Bluray,
}

impl DiscType {
    /// MakeMKV cache size in megabytes
    pub fn makemkv_cache_mb(&self) -> u32 {
        match self {
            DiscType::Dvd => 512,
            DiscType::Bluray => 1024,
        }
    }
}

impl FromStr for DiscType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dvd" => Ok(DiscType::Dvd),
            "bluray" | "blu-ray" => Ok(DiscType::Bluray),
            other => Err(format!("unknown disc type '{}'", other)),
        }
    }
}

/// Where ripped MKVs, encoded outputs and logs live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Movies library root, local path or `host:/path`
    #[serde(default = "default_movies_dir")]
    pub movies_dir: String,
    /// Series library root, local path or `host:/path`
    #[serde(default = "default_series_dir")]
    pub series_dir: String,
    /// Parent of the per-title work directories
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Run log directory (defaults under the work root)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_movies_dir() -> String {
    "/storage/Movies".to_string()
}

fn default_series_dir() -> String {
    "/storage/Series".to_string()
}

fn default_work_root() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            movies_dir: default_movies_dir(),
            series_dir: default_series_dir(),
            work_root: default_work_root(),
            log_dir: None,
        }
    }
}

impl PathsConfig {
    /// Effective log directory
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.work_root.join(".disc_archiver").join("logs"))
    }
}

/// HandBrake encode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// HandBrake preset name
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub output_container: OutputContainer,
    #[serde(default)]
    pub subtitle_mode: SubtitleMode,
    /// Encode in the background while the next disc rips
    #[serde(default)]
    pub overlap: bool,
    /// Maximum concurrent HandBrake encodes in overlap mode
    #[serde(default = "default_encode_jobs")]
    pub encode_jobs: u32,
}

fn default_preset() -> String {
    "HQ 1080p30 Surround".to_string()
}

fn default_encode_jobs() -> u32 {
    1
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            output_container: OutputContainer::default(),
            subtitle_mode: SubtitleMode::default(),
            overlap: false,
            encode_jobs: default_encode_jobs(),
        }
    }
}

/// MakeMKV rip settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RipConfig {
    #[serde(default)]
    pub disc_type: DiscType,
    #[serde(default = "default_disc_device")]
    pub disc_device: String,
    /// Titles shorter than this are not ripped
    #[serde(default = "default_min_title_seconds")]
    pub min_title_seconds: u32,
}

fn default_disc_device() -> String {
    "/dev/sr0".to_string()
}

fn default_min_title_seconds() -> u32 {
    300
}

impl Default for RipConfig {
    fn default() -> Self {
        Self {
            disc_type: DiscType::default(),
            disc_device: default_disc_device(),
            min_title_seconds: default_min_title_seconds(),
        }
    }
}

/// Artifact retention and disk space guard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyConfig {
    /// Never delete MKVs or work directories
    #[serde(default)]
    pub keep_mkvs: bool,
    /// Free space floor checked between discs
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: u64,
}

fn default_min_free_gb() -> u64 {
    20
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            keep_mkvs: false,
            min_free_gb: default_min_free_gb(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub rip: RipConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODE_JOBS -> encode.encode_jobs
    /// - HB_PRESET_DVD -> encode.preset
    /// - HB_OUTPUT_CONTAINER -> encode.output_container
    /// - HB_SUBTITLE_MODE -> encode.subtitle_mode
    /// - RIP_AND_ENCODE_LOG_DIR -> paths.log_dir
    /// - ARCHIVER_MIN_FREE_GB -> safety.min_free_gb
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENCODE_JOBS") {
            if let Ok(jobs) = val.trim().parse::<u32>() {
                self.encode.encode_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("HB_PRESET_DVD") {
            let val = val.trim();
            if !val.is_empty() {
                self.encode.preset = val.to_string();
            }
        }

        if let Ok(val) = env::var("HB_OUTPUT_CONTAINER") {
            if let Ok(container) = val.parse::<OutputContainer>() {
                self.encode.output_container = container;
            }
        }

        if let Ok(val) = env::var("HB_SUBTITLE_MODE") {
            if let Ok(mode) = val.parse::<SubtitleMode>() {
                self.encode.subtitle_mode = mode;
            }
        }

        if let Ok(val) = env::var("RIP_AND_ENCODE_LOG_DIR") {
            let val = val.trim();
            if !val.is_empty() {
                self.paths.log_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("ARCHIVER_MIN_FREE_GB") {
            if let Ok(gb) = val.trim().parse::<u64>() {
                self.safety.min_free_gb = gb;
            }
        }
    }

    /// Reject values that would make a run meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encode.encode_jobs < 1 {
            return Err(ConfigError::Invalid(
                "encode_jobs must be >= 1".to_string(),
            ));
        }
        if self.safety.min_free_gb < 1 {
            return Err(ConfigError::Invalid(
                "min_free_gb must be >= 1".to_string(),
            ));
        }
        if self.encode.preset.trim().is_empty() {
            return Err(ConfigError::Invalid("preset must not be empty".to_string()));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::load_from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
