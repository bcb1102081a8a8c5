//! Bridge configuration and the streamer's layered settings.
//!
//! `BridgeConfig` is what a bridge is initialized with; `validate` turns it
//! into the immutable `ValidatedConfig`. `StreamerConfig` is the application
//! layer: defaults, then a config file, then environment overrides.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::frame::PixelEncoding;
use crate::source::{AcquisitionMode, CaptureRequest};

/// Default wait for a frame per retrieval.
pub const DEFAULT_RETRIEVE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Budget for a camera on a USB 2.0 class link, bytes per second.
pub const USB2_THROUGHPUT_LIMIT: u64 = 24_000_000;
/// Per-camera budget used when two cameras share one host controller.
pub const DUAL_CAMERA_THROUGHPUT_LIMIT: u64 = 150_000_000;

const DEFAULT_DEVICE_URI: &str = "stub://camera0";
const DEFAULT_SYNTHETIC_ENCODING: PixelEncoding = PixelEncoding::Rgb8;
const DEFAULT_FRAMEBUFFER: &str = "/dev/fb0";
const DEFAULT_STREAM_PORT: u16 = 5000;
const DEFAULT_PIPELINE: PipelineKind = if cfg!(feature = "appsrc-gstreamer") {
    PipelineKind::Display
} else {
    PipelineKind::Null
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("width must be greater than zero")]
    ZeroWidth,
    #[error("height must be greater than zero")]
    ZeroHeight,
    #[error("frame rate must be positive, got {0}")]
    InvalidFrameRate(f64),
    #[error("retrieve timeout must be greater than zero")]
    ZeroTimeout,
    #[error("frame limit must be greater than zero")]
    ZeroFrameLimit,
}

// ----------------------------------------------------------------------------
// Post-processing
// ----------------------------------------------------------------------------

/// Clockwise rotation applied downstream of the bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Clockwise270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Self::None),
            90 => Some(Self::Clockwise90),
            180 => Some(Self::Rotate180),
            270 => Some(Self::Clockwise270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Clockwise90 => 90,
            Self::Rotate180 => 180,
            Self::Clockwise270 => 270,
        }
    }

    /// `videoflip` method nick.
    pub fn videoflip_method(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Clockwise90 => "clockwise",
            Self::Rotate180 => "rotate-180",
            Self::Clockwise270 => "counterclockwise",
        }
    }

    /// True when width and height trade places.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Clockwise90 | Self::Clockwise270)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rescale {
    pub width: u32,
    pub height: u32,
}

/// Scaling and rotation requested for the downstream graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostProcess {
    pub rescale: Option<Rescale>,
    pub rotation: Rotation,
}

// ----------------------------------------------------------------------------
// BridgeConfig
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    /// `None` selects the device maximum.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub on_demand: bool,
    pub hardware_trigger: bool,
    pub rescale_width: Option<u32>,
    pub rescale_height: Option<u32>,
    pub rotation: Option<i32>,
    /// `None` streams until stopped.
    pub frame_limit: Option<u64>,
    pub retrieve_timeout: Duration,
    /// Transport budget for this device, bytes per second.
    pub throughput_limit: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            frame_rate: None,
            on_demand: false,
            hardware_trigger: false,
            rescale_width: None,
            rescale_height: None,
            rotation: None,
            frame_limit: None,
            retrieve_timeout: DEFAULT_RETRIEVE_TIMEOUT,
            throughput_limit: None,
        }
    }
}

/// Validated, immutable form of `BridgeConfig`.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedConfig {
    pub request: CaptureRequest,
    pub post: PostProcess,
    pub frame_limit: Option<u64>,
    pub retrieve_timeout: Duration,
}

impl BridgeConfig {
    /// Reject impossible values without resolving anything.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.width == Some(0) {
            return Err(ConfigError::ZeroWidth);
        }
        if self.height == Some(0) {
            return Err(ConfigError::ZeroHeight);
        }
        if let Some(rate) = self.frame_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidFrameRate(rate));
            }
        }
        if self.retrieve_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.frame_limit == Some(0) {
            return Err(ConfigError::ZeroFrameLimit);
        }
        Ok(())
    }

    /// Reject impossible values and resolve soft ones.
    ///
    /// Unusable rescale or rotation settings disable that step with a warning;
    /// on-demand acquisition overrides hardware triggering.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        self.check()?;

        let mode = match (self.on_demand, self.hardware_trigger) {
            (true, true) => {
                log::warn!("BridgeConfig: on-demand and hardware trigger both set, using on-demand");
                AcquisitionMode::OnDemand
            }
            (true, false) => AcquisitionMode::OnDemand,
            (false, true) => AcquisitionMode::HardwareTrigger,
            (false, false) => AcquisitionMode::FreeRun,
        };

        let rescale = match (self.rescale_width, self.rescale_height) {
            (None, None) => None,
            (Some(width), Some(height)) if width >= 2 && height >= 2 => {
                Some(Rescale { width, height })
            }
            (width, height) => {
                log::warn!(
                    "BridgeConfig: rescale {:?}x{:?} needs both sides of at least 2, rescaling disabled",
                    width,
                    height
                );
                None
            }
        };

        let rotation = match self.rotation {
            None => Rotation::None,
            Some(degrees) => Rotation::from_degrees(degrees).unwrap_or_else(|| {
                log::warn!(
                    "BridgeConfig: rotation {} is not 0, 90, 180 or 270, rotation disabled",
                    degrees
                );
                Rotation::None
            }),
        };

        Ok(ValidatedConfig {
            request: CaptureRequest {
                width: self.width,
                height: self.height,
                frame_rate: self.frame_rate,
                mode,
                throughput_limit: self.throughput_limit,
            },
            post: PostProcess { rescale, rotation },
            frame_limit: self.frame_limit,
            retrieve_timeout: self.retrieve_timeout,
        })
    }
}

/// Share a transport budget evenly between `devices` cameras.
pub fn split_throughput(total: u64, devices: usize) -> u64 {
    total / devices.max(1) as u64
}

// ----------------------------------------------------------------------------
// StreamerConfig: file + env layering for the streaming binary
// ----------------------------------------------------------------------------

/// Downstream graph the streamer attaches to the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Display,
    Framebuffer,
    H264Stream,
    H264File,
    /// Two cameras composited side by side on a display.
    SideBySide,
    /// No media framework; frames are pulled and dropped.
    Null,
}

impl PipelineKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Framebuffer => "framebuffer",
            Self::H264Stream => "h264stream",
            Self::H264File => "h264file",
            Self::SideBySide => "sidebyside",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let all = [
            Self::Display,
            Self::Framebuffer,
            Self::H264Stream,
            Self::H264File,
            Self::SideBySide,
            Self::Null,
        ];
        all.into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown pipeline kind {value:?}"))
    }
}

#[derive(Debug, Deserialize, Default)]
struct StreamerConfigFile {
    device: Option<DeviceConfigFile>,
    capture: Option<CaptureConfigFile>,
    post: Option<PostConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    uri: Option<String>,
    second_uri: Option<String>,
    encoding: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    on_demand: Option<bool>,
    hardware_trigger: Option<bool>,
    frame_limit: Option<u64>,
    timeout_ms: Option<u64>,
    throughput_limit: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PostConfigFile {
    rescale_width: Option<u32>,
    rescale_height: Option<u32>,
    rotation: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    kind: Option<PipelineKind>,
    target: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub device: DeviceSettings,
    pub bridge: BridgeConfig,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// `stub://...` for the synthetic camera, a device node otherwise.
    pub uri: String,
    /// Second camera for the side-by-side pipeline.
    pub second_uri: Option<String>,
    /// Encoding the synthetic camera delivers.
    pub encoding: PixelEncoding,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub kind: PipelineKind,
    /// Framebuffer device, stream host or output file, depending on `kind`.
    pub target: Option<String>,
    pub port: u16,
}

impl StreamerConfig {
    /// Defaults, then the `CAMERA_APPSRC_CONFIG` file, then environment, then `validate`.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::load_unvalidated()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The same layers as `load` without the final `validate`, for callers
    /// that apply further overrides (command-line flags) first.
    pub fn load_unvalidated() -> Result<Self> {
        let config_path = std::env::var("CAMERA_APPSRC_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: StreamerConfigFile) -> Result<Self> {
        let device_file = file.device.unwrap_or_default();
        let encoding = match device_file.encoding.as_deref() {
            Some(name) => parse_encoding(name)?,
            None => DEFAULT_SYNTHETIC_ENCODING,
        };
        let device = DeviceSettings {
            uri: device_file
                .uri
                .unwrap_or_else(|| DEFAULT_DEVICE_URI.to_string()),
            second_uri: device_file.second_uri,
            encoding,
        };

        let capture = file.capture.unwrap_or_default();
        let post = file.post.unwrap_or_default();
        let bridge = BridgeConfig {
            width: capture.width,
            height: capture.height,
            frame_rate: capture.fps,
            on_demand: capture.on_demand.unwrap_or(false),
            hardware_trigger: capture.hardware_trigger.unwrap_or(false),
            rescale_width: post.rescale_width,
            rescale_height: post.rescale_height,
            rotation: post.rotation,
            frame_limit: capture.frame_limit,
            retrieve_timeout: capture
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRIEVE_TIMEOUT),
            throughput_limit: capture.throughput_limit,
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            kind: pipeline_file.kind.unwrap_or(DEFAULT_PIPELINE),
            target: pipeline_file.target,
            port: pipeline_file.port.unwrap_or(DEFAULT_STREAM_PORT),
        };

        Ok(Self {
            device,
            bridge,
            pipeline,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("CAMERA_APPSRC_DEVICE") {
            if !uri.trim().is_empty() {
                self.device.uri = uri;
            }
        }
        if let Some(width) = env_number::<u32>("CAMERA_APPSRC_WIDTH")? {
            self.bridge.width = Some(width);
        }
        if let Some(height) = env_number::<u32>("CAMERA_APPSRC_HEIGHT")? {
            self.bridge.height = Some(height);
        }
        if let Some(fps) = env_number::<f64>("CAMERA_APPSRC_FPS")? {
            self.bridge.frame_rate = Some(fps);
        }
        if let Some(timeout_ms) = env_number::<u64>("CAMERA_APPSRC_TIMEOUT_MS")? {
            self.bridge.retrieve_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(limit) = env_number::<u64>("CAMERA_APPSRC_THROUGHPUT_LIMIT")? {
            self.bridge.throughput_limit = Some(limit);
        }
        Ok(())
    }

    /// Check everything the bridge and pipeline helper will need.
    pub fn validate(&mut self) -> Result<()> {
        if self.device.uri.trim().is_empty() {
            return Err(anyhow!("device uri must not be empty"));
        }
        // Soft settings are resolved (and warned about) once, by the bridge.
        self.bridge
            .check()
            .map_err(|err| anyhow!("invalid capture settings: {}", err))?;

        match self.pipeline.kind {
            PipelineKind::Framebuffer => {
                if self.pipeline.target.is_none() {
                    self.pipeline.target = Some(DEFAULT_FRAMEBUFFER.to_string());
                }
            }
            PipelineKind::H264Stream => {
                if self.pipeline.target.is_none() {
                    return Err(anyhow!("h264stream pipeline needs a target host"));
                }
                if self.pipeline.port == 0 {
                    return Err(anyhow!("h264stream pipeline needs a non-zero port"));
                }
            }
            PipelineKind::H264File => {
                if self.pipeline.target.is_none() {
                    return Err(anyhow!("h264file pipeline needs a target path"));
                }
            }
            PipelineKind::SideBySide => {
                if self.device.second_uri.is_none() {
                    return Err(anyhow!("sidebyside pipeline needs device.second_uri"));
                }
            }
            PipelineKind::Display | PipelineKind::Null => {}
        }
        Ok(())
    }

    /// Device URIs in pipeline order.
    pub fn device_uris(&self) -> Vec<&str> {
        let mut uris = vec![self.device.uri.as_str()];
        if self.pipeline.kind == PipelineKind::SideBySide {
            if let Some(second) = self.device.second_uri.as_deref() {
                uris.push(second);
            }
        }
        uris
    }

    /// Bridge settings for one of `devices` cameras sharing the throughput budget.
    pub fn bridge_config_for(&self, devices: usize) -> BridgeConfig {
        let mut bridge = self.bridge.clone();
        if devices > 1 {
            bridge.throughput_limit = Some(split_throughput(
                bridge
                    .throughput_limit
                    .unwrap_or(DUAL_CAMERA_THROUGHPUT_LIMIT * devices as u64),
                devices,
            ));
        }
        bridge
    }
}

pub fn parse_encoding(name: &str) -> Result<PixelEncoding> {
    PixelEncoding::from_name(name).ok_or_else(|| anyhow!("unknown pixel encoding {:?}", name))
}

fn env_number<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got {:?}", key, value)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
