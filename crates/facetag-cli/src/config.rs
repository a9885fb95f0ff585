use anyhow::{bail, Context, Result};
use facetag_core::pipeline::{FaceErrorPolicy, PipelineConfig, DEFAULT_DOWNSCALE};
use facetag_core::{RejectionMode, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "facetag.toml";

/// Application configuration: defaults, then TOML, then `FACETAG_*` env vars.
/// CLI flags are applied on top by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub models: ModelsConfig,
    pub recognition: RecognitionConfig,
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsConfig {
    /// Directory the file names below are resolved against.
    pub dir: PathBuf,
    pub detector: PathBuf,
    pub landmarks: PathBuf,
    pub embedding: PathBuf,
    pub classifier: PathBuf,
    pub projection: PathBuf,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: facetag_core::default_model_dir(),
            detector: "det_10g.onnx".into(),
            landmarks: "landmarks_68.onnx".into(),
            embedding: "descriptor_128.onnx".into(),
            classifier: "classifier.json".into(),
            projection: "projection.json".into(),
        }
    }
}

impl ModelsConfig {
    fn resolve(&self, file: &Path) -> PathBuf {
        self.dir.join(file)
    }

    pub fn detector_path(&self) -> PathBuf {
        self.resolve(&self.detector)
    }

    pub fn landmarks_path(&self) -> PathBuf {
        self.resolve(&self.landmarks)
    }

    pub fn embedding_path(&self) -> PathBuf {
        self.resolve(&self.embedding)
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.resolve(&self.classifier)
    }

    pub fn projection_path(&self) -> PathBuf {
        self.resolve(&self.projection)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecognitionConfig {
    /// Acceptance distance; a face is accepted when strictly below it.
    pub threshold: f32,
    pub rejection: RejectionMode,
    /// Scale applied before detection, in (0, 1].
    pub downscale: f32,
    pub face_errors: FaceErrorPolicy,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            rejection: RejectionMode::default(),
            downscale: DEFAULT_DOWNSCALE,
            face_errors: FaceErrorPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Index of `/dev/video{N}`; 0 is the default capture device.
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuideRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    pub window_title: String,
    /// TrueType font for captions. Labels are only logged without it.
    pub font: Option<PathBuf>,
    pub font_size: f32,
    /// Fixed decorative rectangle; `None` disables it.
    pub guide: Option<GuideRect>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            window_title: "Webcam".to_string(),
            font: Some(PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")),
            font_size: 24.0,
            guide: Some(GuideRect {
                x: 220,
                y: 170,
                width: 230,
                height: 230,
            }),
        }
    }
}

impl Config {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if it exists, then
    /// apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay `FACETAG_*` variables. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACETAG_MODEL_DIR") {
            self.models.dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse(&lookup, "FACETAG_THRESHOLD") {
            self.recognition.threshold = v;
        }
        if let Some(v) = env_parse(&lookup, "FACETAG_DEVICE_INDEX") {
            self.capture.device_index = v;
        }
        if let Some(v) = env_parse(&lookup, "FACETAG_REJECTION") {
            self.recognition.rejection = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.recognition;
        if !r.threshold.is_finite() || r.threshold <= 0.0 {
            bail!("threshold must be finite and positive, got {}", r.threshold);
        }
        if !(r.downscale > 0.0 && r.downscale <= 1.0) {
            bail!("downscale must be in (0, 1], got {}", r.downscale);
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            bail!("capture size must be non-zero");
        }
        if self.display.font_size.is_nan() || self.display.font_size <= 0.0 {
            bail!("font_size must be positive, got {}", self.display.font_size);
        }
        Ok(())
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            threshold: self.recognition.threshold,
            rejection: self.recognition.rejection,
            downscale: self.recognition.downscale,
            face_errors: self.recognition.face_errors,
        }
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}
