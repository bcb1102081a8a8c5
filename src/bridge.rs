//! The acquisition bridge.
//!
//! Owns one persistent `NormalizedFrameBuffer` and turns every demand from the
//! consumer into exactly one publish: the newest frame from the source when
//! one can be retrieved and normalized, otherwise the last good buffer again.
//!
//! The bridge owns no thread. `retrieve_and_publish` runs on whichever thread
//! signals demand and may block for up to the retrieval timeout.
//!
//! State machine:
//!
//! ```text
//! Uninitialized -> Initialized -> Grabbing -> Stopped -> Closed
//!                                    (stop | device removed | frame limit)
//! ```
//!
//! `close` reaches Closed from every state.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::{BridgeConfig, ConfigError, PostProcess, ValidatedConfig};
use crate::consumer::FrameHandoff;
use crate::frame::{GrabResult, NormalizedFrameBuffer, OutputEncoding};
use crate::normalize::{normalize_into, Conversion};
use crate::source::{AcquisitionMode, CaptureFormat, DeviceInfo, FrameSource, SourceError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BridgeState {
    Uninitialized,
    Initialized,
    Grabbing,
    Stopped,
    Closed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Grabbing => "grabbing",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("initialize requires an uninitialized bridge, bridge is {0}")]
    InvalidState(BridgeState),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open device: {0}")]
    DeviceOpen(#[source] SourceError),
    #[error("failed to configure device: {0}")]
    Configure(#[source] SourceError),
    #[error("device reported an unusable frame size {width}x{height}")]
    FrameSize { width: u32, height: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("start requires an initialized bridge, bridge is {0}")]
    InvalidState(BridgeState),
    #[error("failed to start grabbing: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    #[error("retrieve requires a grabbing bridge, bridge is {0}")]
    InvalidState(BridgeState),
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("stop requires a grabbing or stopped bridge, bridge is {0}")]
    InvalidState(BridgeState),
    #[error("failed to stop grabbing: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    #[error("stop during close failed: {0}")]
    Stop(#[from] StopError),
    #[error("failed to release device: {0}")]
    Source(#[source] SourceError),
}

/// Outcome of one demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A buffer was published. `fresh` is false when the last good buffer was
    /// republished; `end_of_stream` is set when this publish reached the frame limit.
    Published { fresh: bool, end_of_stream: bool },
    /// The device is gone. End-of-stream was signalled and nothing published.
    DeviceRemoved,
}

impl Delivery {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Self::DeviceRemoved
                | Self::Published {
                    end_of_stream: true,
                    ..
                }
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    /// Publishes carrying a newly retrieved frame.
    pub fresh: u64,
    /// Publishes that repeated the previous buffer.
    pub stale: u64,
    pub transient_failures: u64,
    pub direct_copies: u64,
    pub conversions: u64,
}

/// Bridge shared between the demand callback and control code. Calls are
/// serialized by the mutex.
pub type SharedBridge<S> = Arc<Mutex<AcquisitionBridge<S>>>;

pub struct AcquisitionBridge<S: FrameSource> {
    source: S,
    handoff: Box<dyn FrameHandoff>,
    state: BridgeState,
    config: Option<ValidatedConfig>,
    format: Option<CaptureFormat>,
    buffer: Option<NormalizedFrameBuffer>,
    device: Option<DeviceInfo>,
    stats: BridgeStats,
    end_of_stream_sent: bool,
}

impl<S: FrameSource> AcquisitionBridge<S> {
    pub fn new(source: S, handoff: impl FrameHandoff + 'static) -> Self {
        Self {
            source,
            handoff: Box::new(handoff),
            state: BridgeState::Uninitialized,
            config: None,
            format: None,
            buffer: None,
            device: None,
            stats: BridgeStats::default(),
            end_of_stream_sent: false,
        }
    }

    pub fn shared(self) -> SharedBridge<S> {
        Arc::new(Mutex::new(self))
    }

    fn name(&self) -> &str {
        self.device
            .as_ref()
            .map(|info| info.friendly_name.as_str())
            .unwrap_or("camera")
    }

    /// Validate `config`, open and configure the device, and allocate the
    /// blank output buffer.
    pub fn initialize(&mut self, config: &BridgeConfig) -> Result<(), InitError> {
        if self.state != BridgeState::Uninitialized {
            return Err(InitError::InvalidState(self.state));
        }
        let validated = config.validate()?;

        let opened_here = !self.source.is_open();
        if opened_here {
            self.source.open().map_err(InitError::DeviceOpen)?;
        }

        let format = match self.source.configure(&validated.request) {
            Ok(format) => format,
            Err(err) => {
                self.abandon_initialize(opened_here);
                return Err(InitError::Configure(err));
            }
        };
        let output = format.encoding.canonical_output();
        let buffer = match NormalizedFrameBuffer::blank(output, format.width, format.height)
            .filter(|buffer| !buffer.is_empty())
        {
            Some(buffer) => buffer,
            None => {
                self.abandon_initialize(opened_here);
                return Err(InitError::FrameSize {
                    width: format.width,
                    height: format.height,
                });
            }
        };

        let device = self.source.device_info();
        log::info!(
            "AcquisitionBridge: {} initialized, {}x{} {} -> {} at {:.2} fps ({})",
            device.friendly_name,
            format.width,
            format.height,
            format.encoding,
            output,
            format.frame_rate,
            format.mode
        );
        if format.mode != validated.request.mode {
            log::warn!(
                "AcquisitionBridge: {} runs {} instead of requested {}",
                device.friendly_name,
                format.mode,
                validated.request.mode
            );
        }

        self.device = Some(device);
        self.format = Some(format);
        self.buffer = Some(buffer);
        self.config = Some(validated);
        self.state = BridgeState::Initialized;
        Ok(())
    }

    fn abandon_initialize(&mut self, opened_here: bool) {
        if !opened_here {
            return;
        }
        if let Err(err) = self.source.close() {
            log::warn!(
                "AcquisitionBridge: closing device after failed initialize: {}",
                err
            );
        }
    }

    /// Start latest-image-only grabbing.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != BridgeState::Initialized {
            return Err(StartError::InvalidState(self.state));
        }
        self.source.start_grabbing()?;
        self.state = BridgeState::Grabbing;
        log::info!("AcquisitionBridge: {} grabbing", self.name());
        Ok(())
    }

    /// Serve one demand from the consumer.
    ///
    /// Publishes exactly once unless the device has been removed. Retrieval
    /// problems never fail the call; they republish the last good buffer.
    pub fn retrieve_and_publish(&mut self) -> Result<Delivery, RetrieveError> {
        if self.state != BridgeState::Grabbing {
            return Err(RetrieveError::InvalidState(self.state));
        }

        if !self.source.is_device_present() {
            log::warn!(
                "AcquisitionBridge: {} was removed, ending stream",
                self.name()
            );
            self.signal_end_of_stream();
            self.state = BridgeState::Stopped;
            return Ok(Delivery::DeviceRemoved);
        }

        let fresh = self.refresh_buffer();
        let Some(buffer) = self.buffer.as_ref() else {
            return Err(RetrieveError::InvalidState(self.state));
        };
        self.handoff.publish(buffer.published());

        self.stats.published += 1;
        if fresh {
            self.stats.fresh += 1;
        } else {
            self.stats.stale += 1;
        }

        let limit_reached = self
            .config
            .as_ref()
            .and_then(|config| config.frame_limit)
            .is_some_and(|limit| self.stats.published >= limit);
        if limit_reached {
            log::info!(
                "AcquisitionBridge: {} reached its frame limit of {}",
                self.name(),
                self.stats.published
            );
            self.signal_end_of_stream();
            self.state = BridgeState::Stopped;
        }

        Ok(Delivery::Published {
            fresh,
            end_of_stream: limit_reached,
        })
    }

    /// Pull the newest frame into the buffer. Returns false when the buffer
    /// was left as it was.
    fn refresh_buffer(&mut self) -> bool {
        let (timeout, on_demand) = match (&self.config, &self.format) {
            (Some(config), Some(format)) => (
                config.retrieve_timeout,
                format.mode == AcquisitionMode::OnDemand,
            ),
            _ => return false,
        };

        if on_demand {
            if let Err(err) = self.source.trigger_once() {
                self.absorb(format_args!("software trigger failed: {}", err));
                return false;
            }
        }

        let Some(buffer) = self.buffer.as_mut() else {
            return false;
        };
        let outcome = match self.source.retrieve_latest(timeout) {
            Ok(GrabResult::Succeeded(frame)) => match normalize_into(&frame, buffer) {
                Ok(conversion) => {
                    log::trace!(
                        "AcquisitionBridge: frame {} {:?}",
                        frame.sequence,
                        conversion
                    );
                    Ok(conversion)
                }
                Err(err) => Err(format!("frame {} not usable: {}", frame.sequence, err)),
            },
            Ok(GrabResult::Failed { code, description }) => {
                Err(format!("grab failed ({:#x}): {}", code, description))
            }
            Err(err) => Err(format!("retrieve failed: {}", err)),
        };

        match outcome {
            Ok(Conversion::Copied) => {
                self.stats.direct_copies += 1;
                true
            }
            Ok(Conversion::Converted) => {
                self.stats.conversions += 1;
                true
            }
            Err(reason) => {
                self.absorb(reason);
                false
            }
        }
    }

    fn absorb(&mut self, reason: impl fmt::Display) {
        self.stats.transient_failures += 1;
        log::warn!(
            "AcquisitionBridge: {}: {}, republishing last buffer",
            self.name(),
            reason
        );
    }

    fn signal_end_of_stream(&mut self) {
        if self.end_of_stream_sent {
            return;
        }
        self.end_of_stream_sent = true;
        log::debug!("AcquisitionBridge: {} end of stream", self.name());
        self.handoff.end_of_stream();
    }

    /// Signal end-of-stream, then halt the grab engine.
    ///
    /// From Stopped this only halts an engine that is still running.
    pub fn stop(&mut self) -> Result<(), StopError> {
        match self.state {
            BridgeState::Grabbing => {
                self.signal_end_of_stream();
                self.state = BridgeState::Stopped;
                self.source.stop_grabbing()?;
                log::info!("AcquisitionBridge: {} stopped", self.name());
                Ok(())
            }
            BridgeState::Stopped => {
                if self.source.is_grabbing() {
                    self.source.stop_grabbing()?;
                    log::info!("AcquisitionBridge: {} grab engine halted", self.name());
                }
                Ok(())
            }
            other => Err(StopError::InvalidState(other)),
        }
    }

    /// Stop if needed and release the device. Idempotent.
    pub fn close(&mut self) -> Result<(), CloseError> {
        if self.state == BridgeState::Closed {
            return Ok(());
        }

        let mut result = Ok(());
        if matches!(self.state, BridgeState::Grabbing | BridgeState::Stopped) {
            if let Err(err) = self.stop() {
                log::warn!("AcquisitionBridge: {}: {}", self.name(), err);
                result = Err(CloseError::Stop(err));
            }
        }
        if let Err(err) = self.source.close() {
            log::warn!("AcquisitionBridge: {}: failed to close device: {}", self.name(), err);
            if result.is_ok() {
                result = Err(CloseError::Source(err));
            }
        }

        self.buffer = None;
        self.state = BridgeState::Closed;
        log::info!("AcquisitionBridge: {} closed", self.name());
        result
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn width(&self) -> Option<u32> {
        self.format.as_ref().map(|format| format.width)
    }

    pub fn height(&self) -> Option<u32> {
        self.format.as_ref().map(|format| format.height)
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.format.as_ref().map(|format| format.frame_rate)
    }

    pub fn output_encoding(&self) -> Option<OutputEncoding> {
        self.format
            .as_ref()
            .map(|format| format.encoding.canonical_output())
    }

    pub fn is_color(&self) -> bool {
        self.output_encoding() == Some(OutputEncoding::Rgb24)
    }

    pub fn capture_format(&self) -> Option<&CaptureFormat> {
        self.format.as_ref()
    }

    pub fn post_process(&self) -> PostProcess {
        self.config
            .as_ref()
            .map(|config| config.post)
            .unwrap_or_default()
    }

    pub fn frame_limit(&self) -> Option<u64> {
        self.config.as_ref().and_then(|config| config.frame_limit)
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Current buffer contents, `None` before initialize and after close.
    pub fn buffer(&self) -> Option<&NormalizedFrameBuffer> {
        self.buffer.as_ref()
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> Drop for AcquisitionBridge<S> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("AcquisitionBridge: close on drop failed: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
