//! Consumer side of the bridge: the publish handoff and the demand contract.
//!
//! A consumer calls the demand closure whenever it wants data; the bridge
//! answers through `FrameHandoff` on the same thread before the call returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::{Delivery, SharedBridge};
use crate::frame::{OutputEncoding, PublishedFrame};
use crate::source::FrameSource;

/// Receives what the bridge publishes.
///
/// `publish` borrows the bridge's buffer for the duration of the call only.
pub trait FrameHandoff: Send {
    fn publish(&mut self, frame: PublishedFrame<'_>);

    /// No more frames will follow.
    fn end_of_stream(&mut self);
}

/// Owned copy of a published frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopiedFrame {
    pub width: u32,
    pub height: u32,
    pub encoding: OutputEncoding,
    pub sequence: Option<u64>,
    pub data: Vec<u8>,
}

impl From<PublishedFrame<'_>> for CopiedFrame {
    fn from(frame: PublishedFrame<'_>) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            encoding: frame.encoding,
            sequence: frame.sequence,
            data: frame.bytes().to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandoffEvent {
    Frame(CopiedFrame),
    EndOfStream,
}

/// Copies every publish onto a channel.
pub struct ChannelHandoff {
    tx: Sender<HandoffEvent>,
}

impl ChannelHandoff {
    pub fn new() -> (Self, Receiver<HandoffEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl FrameHandoff for ChannelHandoff {
    fn publish(&mut self, frame: PublishedFrame<'_>) {
        if self.tx.send(HandoffEvent::Frame(frame.into())).is_err() {
            log::debug!("ChannelHandoff: receiver gone, frame dropped");
        }
    }

    fn end_of_stream(&mut self) {
        if self.tx.send(HandoffEvent::EndOfStream).is_err() {
            log::debug!("ChannelHandoff: receiver gone, end of stream dropped");
        }
    }
}

/// Counts publishes and drops the data.
#[derive(Clone, Debug, Default)]
pub struct CountingHandoff {
    published: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    ended: Arc<AtomicBool>,
}

impl CountingHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl FrameHandoff for CountingHandoff {
    fn publish(&mut self, frame: PublishedFrame<'_>) {
        self.published.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(frame.len() as u64, Ordering::SeqCst);
    }

    fn end_of_stream(&mut self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// The demand signal: a closure the consumer calls whenever it needs data.
///
/// Returns `None` when the bridge refused the demand (not grabbing, or its
/// lock is poisoned).
pub fn demand_callback<S>(bridge: SharedBridge<S>) -> impl Fn() -> Option<Delivery> + Send + Sync + 'static
where
    S: FrameSource + 'static,
{
    move || {
        let mut guard = match bridge.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("AcquisitionBridge: bridge lock poisoned, ignoring demand");
                return None;
            }
        };
        match guard.retrieve_and_publish() {
            Ok(delivery) => Some(delivery),
            Err(err) => {
                log::debug!("AcquisitionBridge: demand ignored: {}", err);
                None
            }
        }
    }
}

// ----------------------------------------------------------------------------
// PullDriver: demand without a media framework
// ----------------------------------------------------------------------------

/// Why a `PullDriver` run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullEnd {
    /// The stop flag was raised.
    Stopped,
    /// The bridge signalled end-of-stream.
    EndOfStream,
    /// The bridge refused a demand.
    Refused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PullSummary {
    pub demands: u64,
    pub fresh: u64,
    pub stale: u64,
    pub end: PullEnd,
}

/// Signals demand in a loop, optionally paced to a frame rate.
pub struct PullDriver {
    stop: Arc<AtomicBool>,
    period: Option<Duration>,
}

impl Default for PullDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PullDriver {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            period: None,
        }
    }

    /// Issue at most `frame_rate` demands per second. Non-positive rates
    /// leave the driver unpaced.
    pub fn paced(mut self, frame_rate: f64) -> Self {
        self.period = (frame_rate > 0.0 && frame_rate.is_finite())
            .then(|| Duration::from_secs_f64(1.0 / frame_rate));
        self
    }

    /// Flag that ends `run` before its next demand.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn run<F>(&self, demand: F) -> PullSummary
    where
        F: Fn() -> Option<Delivery>,
    {
        let mut summary = PullSummary {
            demands: 0,
            fresh: 0,
            stale: 0,
            end: PullEnd::Stopped,
        };
        let mut next_at = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            if let Some(period) = self.period {
                let now = Instant::now();
                if next_at > now {
                    std::thread::sleep(next_at - now);
                }
                // A slow demand restarts the schedule rather than bursting to catch up.
                next_at = next_at.max(now) + period;
            }

            summary.demands += 1;
            match demand() {
                Some(Delivery::Published {
                    fresh,
                    end_of_stream,
                }) => {
                    if fresh {
                        summary.fresh += 1;
                    } else {
                        summary.stale += 1;
                    }
                    if end_of_stream {
                        summary.end = PullEnd::EndOfStream;
                        break;
                    }
                }
                Some(Delivery::DeviceRemoved) => {
                    summary.end = PullEnd::EndOfStream;
                    break;
                }
                None => {
                    summary.end = PullEnd::Refused;
                    break;
                }
            }
        }

        log::debug!(
            "PullDriver: {} demands ({} fresh, {} stale), ended: {:?}",
            summary.demands,
            summary.fresh,
            summary.stale,
            summary.end
        );
        summary
    }
}
