//! camera-appsrc
//!
//! Bridges a freerunning camera (push: its grab engine produces frames on its
//! own clock) to a demand-driven media pipeline (pull: the consumer asks for
//! one frame at a time).
//!
//! # Architecture
//!
//! The bridge keeps three promises:
//!
//! 1. **Latest image only**: frames the consumer did not ask for in time are
//!    dropped in the grab engine; the consumer always gets the newest one.
//! 2. **One publish per demand**: when the newest frame cannot be had, the last
//!    good buffer (or the blank placeholder) is published again.
//! 3. **Clean end**: end-of-stream reaches the consumer before the grab engine
//!    halts, whether the stream ends by stop, device removal or frame limit.
//!
//! # Module Structure
//!
//! - `frame`: pixel encodings, grab results, the persistent output buffer
//! - `normalize`: conversion of any supported encoding to RGB24 or GRAY8
//! - `source`: the `FrameSource` trait, the latest-image slot, synthetic and V4L2 cameras
//! - `bridge`: `AcquisitionBridge` and its state machine
//! - `consumer`: publish handoff, demand closure, headless pull driver
//! - `config`: bridge configuration and the streamer's layered settings
//! - `appsrc`, `pipeline`: GStreamer wiring (feature: appsrc-gstreamer)

#[cfg(feature = "appsrc-gstreamer")]
pub mod appsrc;
pub mod bridge;
pub mod config;
pub mod consumer;
pub mod frame;
pub mod normalize;
#[cfg(feature = "appsrc-gstreamer")]
pub mod pipeline;
pub mod source;

pub use bridge::{
    AcquisitionBridge, BridgeState, BridgeStats, CloseError, Delivery, InitError, RetrieveError,
    SharedBridge, StartError, StopError,
};
pub use config::{
    split_throughput, BridgeConfig, ConfigError, PostProcess, Rescale, Rotation, StreamerConfig,
};
pub use consumer::{
    demand_callback, ChannelHandoff, CopiedFrame, CountingHandoff, FrameHandoff, HandoffEvent,
    PullDriver, PullEnd, PullSummary,
};
pub use frame::{
    GrabResult, GrabStatus, NormalizedFrameBuffer, OutputEncoding, OwnedFrame, PixelEncoding,
    PublishedFrame, RawFrame,
};
pub use normalize::{normalize_into, Conversion, NormalizeError};
pub use source::{
    AcquisitionMode, CaptureFormat, CaptureRequest, DeviceInfo, FrameSource, SourceError,
    SyntheticConfig, SyntheticControl, SyntheticSource,
};
#[cfg(feature = "source-v4l2")]
pub use source::V4l2Source;
