//! Frame sources: camera drivers with their own grab engine.
//!
//! This module provides different sources for raw frames:
//! - Synthetic camera (`stub://` URIs, testing and headless demos)
//! - USB/V4L2 devices (feature: source-v4l2)
//!
//! Every source runs a latest-image-only grab engine: frames arrive on the
//! engine's own thread and land in a single output slot, overwriting whatever
//! nobody has retrieved yet. The bridge pulls from that slot on demand.
//!
//! Sources know nothing about bridges or consumers.

use std::fmt;
use std::time::Duration;

use crate::frame::{GrabResult, PixelEncoding};

pub mod latest;
pub mod synthetic;
#[cfg(feature = "source-v4l2")]
pub mod v4l2;

pub use latest::{LatestImageSlot, Take};
pub use synthetic::{SyntheticConfig, SyntheticControl, SyntheticSource};
#[cfg(feature = "source-v4l2")]
pub use v4l2::V4l2Source;

/// How frames are started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AcquisitionMode {
    /// The device captures continuously at its frame rate.
    FreeRun,
    /// One software trigger per retrieval.
    OnDemand,
    /// Frames start on an external hardware trigger line.
    HardwareTrigger,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FreeRun => "freerun",
            Self::OnDemand => "on-demand",
            Self::HardwareTrigger => "hardware-trigger",
        })
    }
}

/// What the bridge asks a device to apply. `None` means "device maximum".
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub mode: AcquisitionMode,
    /// Transport budget in bytes per second.
    pub throughput_limit: Option<u64>,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            frame_rate: None,
            mode: AcquisitionMode::FreeRun,
            throughput_limit: None,
        }
    }
}

/// What the device actually applied.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    /// Resulting frame rate after bandwidth limits.
    pub frame_rate: f64,
    pub mode: AcquisitionMode,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub friendly_name: String,
    pub device_class: String,
    pub serial: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, serial {})",
            self.friendly_name, self.device_class, self.serial
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("device {0} not found")]
    NotFound(String),
    #[error("device was removed")]
    DeviceRemoved,
    #[error("device is not open")]
    NotOpen,
    #[error("device has not been configured")]
    NotConfigured,
    #[error("grab engine is not running")]
    NotGrabbing,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("driver error: {0}")]
    Driver(String),
}

impl SourceError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Capability interface of a camera with a latest-image-only grab engine.
///
/// `retrieve_latest` borrows the source mutably, so the returned frame view
/// cannot outlive the next retrieval.
pub trait FrameSource: Send {
    /// Acquire the device handle.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Release the device handle. Stops grabbing first. Idempotent.
    fn close(&mut self) -> Result<(), SourceError>;

    fn is_open(&self) -> bool;

    /// Apply `request` and report what the device ended up with. A device
    /// without triggering support falls back to freerun.
    fn configure(&mut self, request: &CaptureRequest) -> Result<CaptureFormat, SourceError>;

    fn start_grabbing(&mut self) -> Result<(), SourceError>;

    fn stop_grabbing(&mut self) -> Result<(), SourceError>;

    fn is_grabbing(&self) -> bool;

    /// Wait up to `timeout` for the newest frame. Frames that arrived earlier
    /// and were never retrieved are gone.
    fn retrieve_latest(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError>;

    /// Request exactly one frame (on-demand mode).
    fn trigger_once(&mut self) -> Result<(), SourceError>;

    fn is_device_present(&self) -> bool;

    fn device_info(&self) -> DeviceInfo;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<(), SourceError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), SourceError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn configure(&mut self, request: &CaptureRequest) -> Result<CaptureFormat, SourceError> {
        (**self).configure(request)
    }

    fn start_grabbing(&mut self) -> Result<(), SourceError> {
        (**self).start_grabbing()
    }

    fn stop_grabbing(&mut self) -> Result<(), SourceError> {
        (**self).stop_grabbing()
    }

    fn is_grabbing(&self) -> bool {
        (**self).is_grabbing()
    }

    fn retrieve_latest(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError> {
        (**self).retrieve_latest(timeout)
    }

    fn trigger_once(&mut self) -> Result<(), SourceError> {
        (**self).trigger_once()
    }

    fn is_device_present(&self) -> bool {
        (**self).is_device_present()
    }

    fn device_info(&self) -> DeviceInfo {
        (**self).device_info()
    }
}

/// Open a source by URI: `stub://...` is the synthetic camera, anything else
/// is a V4L2 device node.
///
/// `encoding` only applies to the synthetic camera.
pub fn source_for_uri(
    uri: &str,
    encoding: PixelEncoding,
) -> anyhow::Result<Box<dyn FrameSource>> {
    if uri.starts_with("stub://") {
        let config = SyntheticConfig {
            name: uri.to_string(),
            encoding,
            ..SyntheticConfig::default()
        };
        Ok(Box::new(SyntheticSource::new(config)))
    } else {
        #[cfg(feature = "source-v4l2")]
        {
            Ok(Box::new(V4l2Source::new(uri)))
        }
        #[cfg(not(feature = "source-v4l2"))]
        {
            anyhow::bail!("device {uri} requires the source-v4l2 feature")
        }
    }
}
