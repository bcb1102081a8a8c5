//! Synthetic camera for tests and headless runs.
//!
//! `SyntheticSource` behaves like a driver with its own grab engine: while
//! grabbing in freerun mode a background thread generates frames at the
//! configured rate into a `LatestImageSlot`. A `SyntheticControl` handle lets
//! tests feed exact frames, fire triggers, inject failed grabs and unplug the
//! device from another thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::latest::{LatestImageSlot, Take};
use super::{AcquisitionMode, CaptureFormat, CaptureRequest, DeviceInfo, FrameSource, SourceError};
use crate::frame::{GrabResult, GrabStatus, OwnedFrame, PixelEncoding};

/// Error code reported on injected failed grabs.
pub const SYNTHETIC_GRAB_FAILURE: u32 = 0xE100_0014;

/// Longest single sleep of the generator thread, bounds stop latency.
const GENERATOR_TICK: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub serial: String,
    /// Encoding the sensor delivers.
    pub encoding: PixelEncoding,
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: f64,
    pub supports_trigger: bool,
    /// Run the freerun generator thread while grabbing. When off, frames
    /// only arrive through `SyntheticControl` or triggers.
    pub generate: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://camera".to_string(),
            serial: "SYN-0001".to_string(),
            encoding: PixelEncoding::Rgb8,
            max_width: 1280,
            max_height: 720,
            max_frame_rate: 30.0,
            supports_trigger: true,
            generate: true,
        }
    }
}

impl SyntheticConfig {
    /// No generator thread: every frame is pushed by the test.
    pub fn manual(encoding: PixelEncoding, width: u32, height: u32) -> Self {
        Self {
            encoding,
            max_width: width,
            max_height: height,
            generate: false,
            ..Self::default()
        }
    }
}

/// Deterministic test pattern for `sequence`.
///
/// The scene shifts every 50 frames so consecutive frames differ in more than
/// their phase.
pub fn synthetic_pixels(encoding: PixelEncoding, width: u32, height: u32, sequence: u64) -> Vec<u8> {
    let len = encoding.frame_len(width, height).unwrap_or(0);
    let scene = sequence / 50;
    let mut pixels = vec![0u8; len];
    for (i, pixel) in pixels.iter_mut().enumerate() {
        *pixel = ((i as u64 + sequence + scene) % 256) as u8;
    }
    pixels
}

// ----------------------------------------------------------------------------
// State shared between the source, its generator thread and control handles
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Shared {
    slot: LatestImageSlot,
    present: AtomicBool,
    grabbing: AtomicBool,
    sequence: AtomicU64,
    triggers: AtomicU64,
    pending_failures: AtomicU32,
    format: Mutex<Option<CaptureFormat>>,
}

impl Shared {
    fn new() -> Self {
        let slot = LatestImageSlot::new();
        slot.halt();
        Self {
            slot,
            present: AtomicBool::new(true),
            grabbing: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            pending_failures: AtomicU32::new(0),
            format: Mutex::new(None),
        }
    }

    fn format(&self) -> Option<CaptureFormat> {
        self.format
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_format(&self, format: Option<CaptureFormat>) {
        *self.format.lock().unwrap_or_else(PoisonError::into_inner) = format;
    }

    fn accepting(&self) -> bool {
        self.grabbing.load(Ordering::SeqCst) && self.present.load(Ordering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store `data` as the next frame in the current format.
    fn deliver(&self, data: Option<Vec<u8>>) -> Option<u64> {
        if !self.accepting() {
            return None;
        }
        let format = self.format()?;
        let sequence = self.next_sequence();
        let data = data.unwrap_or_else(|| {
            synthetic_pixels(format.encoding, format.width, format.height, sequence)
        });
        self.slot.put(OwnedFrame::succeeded(
            format.encoding,
            format.width,
            format.height,
            sequence,
            data,
        ));
        Some(sequence)
    }
}

/// Handle for driving a `SyntheticSource` from tests or other threads.
#[derive(Clone, Debug)]
pub struct SyntheticControl {
    shared: Arc<Shared>,
}

impl SyntheticControl {
    /// Deliver a generated frame. `None` unless the engine is grabbing.
    pub fn push_generated(&self) -> Option<u64> {
        self.shared.deliver(None)
    }

    /// Deliver `data` as the next frame in the configured format.
    pub fn push_pixels(&self, data: Vec<u8>) -> Option<u64> {
        self.shared.deliver(Some(data))
    }

    /// Deliver an arbitrary frame, including mismatched geometry or a
    /// failed status. Ignored unless grabbing.
    pub fn push_frame(&self, frame: OwnedFrame) -> bool {
        if !self.shared.accepting() {
            return false;
        }
        self.shared.slot.put(frame);
        true
    }

    /// Pulse the trigger input line. Only produces a frame in hardware trigger mode.
    pub fn fire_hardware_trigger(&self) -> Option<u64> {
        let mode = self.shared.format()?.mode;
        if mode != AcquisitionMode::HardwareTrigger {
            return None;
        }
        self.shared.deliver(None)
    }

    /// Simulate pulling the cable. Wakes any retrieval in progress.
    pub fn unplug(&self) {
        self.shared.present.store(false, Ordering::SeqCst);
        self.shared.slot.halt();
    }

    pub fn replug(&self) {
        self.shared.present.store(true, Ordering::SeqCst);
    }

    /// The next `count` retrievals report a failed grab.
    pub fn fail_next_grabs(&self, count: u32) {
        self.shared
            .pending_failures
            .fetch_add(count, Ordering::SeqCst);
    }

    pub fn is_grabbing(&self) -> bool {
        self.shared.grabbing.load(Ordering::SeqCst)
    }

    pub fn is_present(&self) -> bool {
        self.shared.present.load(Ordering::SeqCst)
    }

    /// Software triggers received so far.
    pub fn trigger_count(&self) -> u64 {
        self.shared.triggers.load(Ordering::SeqCst)
    }

    /// Frames overwritten in the output slot before retrieval.
    pub fn discarded(&self) -> u64 {
        self.shared.slot.discarded()
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// SyntheticSource
// ----------------------------------------------------------------------------

pub struct SyntheticSource {
    config: SyntheticConfig,
    shared: Arc<Shared>,
    open: bool,
    format: Option<CaptureFormat>,
    current: Option<OwnedFrame>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            open: false,
            format: None,
            current: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn control(&self) -> SyntheticControl {
        SyntheticControl {
            shared: self.shared.clone(),
        }
    }

    fn spawn_generator(&mut self, frame_rate: f64) -> Result<(), SourceError> {
        let shared = self.shared.clone();
        let running = self.running.clone();
        let period = Duration::from_secs_f64(1.0 / frame_rate.max(0.001));
        let handle = std::thread::Builder::new()
            .name("synthetic-grab".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let deadline = Instant::now() + period;
                    loop {
                        let now = Instant::now();
                        if now >= deadline || !running.load(Ordering::SeqCst) {
                            break;
                        }
                        std::thread::sleep((deadline - now).min(GENERATOR_TICK));
                    }
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    shared.deliver(None);
                }
            })
            .map_err(|err| SourceError::io("spawn synthetic grab thread", err))?;
        self.worker = Some(handle);
        Ok(())
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<(), SourceError> {
        if !self.shared.present.load(Ordering::SeqCst) {
            return Err(SourceError::NotFound(self.config.name.clone()));
        }
        self.open = true;
        log::info!("SyntheticSource: opened {} (synthetic)", self.config.name);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if !self.open {
            return Ok(());
        }
        self.stop_grabbing()?;
        self.open = false;
        self.current = None;
        log::info!("SyntheticSource: closed {}", self.config.name);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn configure(&mut self, request: &CaptureRequest) -> Result<CaptureFormat, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        if !self.shared.present.load(Ordering::SeqCst) {
            return Err(SourceError::DeviceRemoved);
        }
        if self.is_grabbing() {
            return Err(SourceError::Unsupported(
                "reconfiguring while grabbing".to_string(),
            ));
        }

        let width = request.width.unwrap_or(self.config.max_width).min(self.config.max_width);
        let height = request
            .height
            .unwrap_or(self.config.max_height)
            .min(self.config.max_height);
        let frame_len = self
            .config
            .encoding
            .frame_len(width, height)
            .filter(|&len| len > 0)
            .ok_or_else(|| {
                SourceError::Unsupported(format!(
                    "{} at {}x{}",
                    self.config.encoding, width, height
                ))
            })?;

        let mut frame_rate = request
            .frame_rate
            .unwrap_or(self.config.max_frame_rate)
            .min(self.config.max_frame_rate);
        if let Some(limit) = request.throughput_limit {
            let bandwidth_rate = limit as f64 / frame_len as f64;
            if bandwidth_rate < frame_rate {
                log::info!(
                    "SyntheticSource: {} limited to {:.2} fps by throughput limit of {} B/s",
                    self.config.name,
                    bandwidth_rate,
                    limit
                );
                frame_rate = bandwidth_rate;
            }
        }

        let mut mode = request.mode;
        if mode != AcquisitionMode::FreeRun && !self.config.supports_trigger {
            log::warn!(
                "SyntheticSource: {} has no trigger support, using freerun instead of {}",
                self.config.name,
                mode
            );
            mode = AcquisitionMode::FreeRun;
        }

        let format = CaptureFormat {
            width,
            height,
            encoding: self.config.encoding,
            frame_rate,
            mode,
        };
        self.shared.set_format(Some(format.clone()));
        self.format = Some(format.clone());
        log::info!(
            "SyntheticSource: configured {} for {}x{} {} at {:.2} fps ({})",
            self.config.name,
            width,
            height,
            format.encoding,
            frame_rate,
            mode
        );
        Ok(format)
    }

    fn start_grabbing(&mut self) -> Result<(), SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        let format = self.format.clone().ok_or(SourceError::NotConfigured)?;
        if !self.shared.present.load(Ordering::SeqCst) {
            return Err(SourceError::DeviceRemoved);
        }
        if self.is_grabbing() {
            return Ok(());
        }

        self.shared.slot.reopen();
        self.shared.grabbing.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        if self.config.generate && format.mode == AcquisitionMode::FreeRun {
            if let Err(err) = self.spawn_generator(format.frame_rate) {
                self.running.store(false, Ordering::SeqCst);
                self.shared.grabbing.store(false, Ordering::SeqCst);
                self.shared.slot.halt();
                return Err(err);
            }
        }
        log::debug!("SyntheticSource: {} grabbing", self.config.name);
        Ok(())
    }

    fn stop_grabbing(&mut self) -> Result<(), SourceError> {
        self.running.store(false, Ordering::SeqCst);
        let was_grabbing = self.shared.grabbing.swap(false, Ordering::SeqCst);
        self.shared.slot.halt();
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| SourceError::Driver("synthetic grab thread panicked".to_string()))?;
        }
        if was_grabbing {
            log::debug!("SyntheticSource: {} stopped grabbing", self.config.name);
        }
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        self.shared.grabbing.load(Ordering::SeqCst)
    }

    fn retrieve_latest(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        if !self.shared.present.load(Ordering::SeqCst) {
            return Err(SourceError::DeviceRemoved);
        }
        if !self.is_grabbing() {
            return Err(SourceError::NotGrabbing);
        }

        let injected = self
            .shared
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Ok(GrabResult::Failed {
                code: SYNTHETIC_GRAB_FAILURE,
                description: "synthetic buffer incompletely grabbed".to_string(),
            });
        }

        match self.shared.slot.take(timeout) {
            Take::Frame(frame) => {
                if let GrabStatus::Failed { description, .. } = &frame.status {
                    log::debug!(
                        "SyntheticSource: frame {} flagged as failed: {}",
                        frame.sequence,
                        description
                    );
                }
                let frame = self.current.insert(frame);
                Ok(GrabResult::from_owned(frame))
            }
            Take::TimedOut => Err(SourceError::Timeout(timeout)),
            Take::Halted if !self.shared.present.load(Ordering::SeqCst) => {
                Err(SourceError::DeviceRemoved)
            }
            Take::Halted => Err(SourceError::NotGrabbing),
        }
    }

    fn trigger_once(&mut self) -> Result<(), SourceError> {
        if !self.shared.present.load(Ordering::SeqCst) {
            return Err(SourceError::DeviceRemoved);
        }
        if !self.is_grabbing() {
            return Err(SourceError::NotGrabbing);
        }
        self.shared.triggers.fetch_add(1, Ordering::SeqCst);
        self.shared.deliver(None);
        Ok(())
    }

    fn is_device_present(&self) -> bool {
        self.shared.present.load(Ordering::SeqCst)
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            friendly_name: self.config.name.clone(),
            device_class: "Synthetic".to_string(),
            serial: self.config.serial.clone(),
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("SyntheticSource: close on drop failed: {}", err);
        }
        // A never-opened source may still own a generator thread.
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn request(mode: AcquisitionMode) -> CaptureRequest {
        CaptureRequest {
            mode,
            ..CaptureRequest::default()
        }
    }

    fn manual_source(encoding: PixelEncoding) -> Result<SyntheticSource> {
        let mut source = SyntheticSource::new(SyntheticConfig::manual(encoding, 4, 2));
        source.open()?;
        source.configure(&request(AcquisitionMode::FreeRun))?;
        Ok(source)
    }

    #[test]
    fn freerun_generator_produces_frames() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            max_width: 8,
            max_height: 4,
            max_frame_rate: 200.0,
            ..SyntheticConfig::default()
        });
        source.open()?;
        source.configure(&request(AcquisitionMode::FreeRun))?;
        source.start_grabbing()?;

        match source.retrieve_latest(Duration::from_secs(5))? {
            GrabResult::Succeeded(frame) => {
                assert_eq!(frame.width, 8);
                assert_eq!(frame.height, 4);
                assert_eq!(frame.data.len(), 8 * 4 * 3);
            }
            GrabResult::Failed { description, .. } => panic!("unexpected failure {description}"),
        }

        source.stop_grabbing()?;
        assert!(!source.is_grabbing());
        Ok(())
    }

    #[test]
    fn retrieval_returns_newest_pushed_frame() -> Result<()> {
        let mut source = manual_source(PixelEncoding::Mono8)?;
        let control = source.control();
        source.start_grabbing()?;

        control.push_pixels(vec![1; 8]);
        control.push_pixels(vec![2; 8]);
        let newest = control.push_pixels(vec![3; 8]);

        match source.retrieve_latest(Duration::from_millis(100))? {
            GrabResult::Succeeded(frame) => {
                assert_eq!(Some(frame.sequence), newest);
                assert_eq!(frame.data, &[3u8; 8][..]);
            }
            GrabResult::Failed { .. } => panic!("expected frame"),
        }
        assert_eq!(control.discarded(), 2);
        assert!(matches!(
            source.retrieve_latest(Duration::from_millis(20)),
            Err(SourceError::Timeout(_))
        ));
        Ok(())
    }

    #[test]
    fn throughput_limit_lowers_frame_rate() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::manual(PixelEncoding::Mono8, 100, 100));
        source.open()?;
        let format = source.configure(&CaptureRequest {
            frame_rate: Some(30.0),
            throughput_limit: Some(100_000),
            ..CaptureRequest::default()
        })?;
        assert!((format.frame_rate - 10.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn trigger_request_downgrades_without_support() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig {
            supports_trigger: false,
            ..SyntheticConfig::manual(PixelEncoding::Mono8, 4, 4)
        });
        source.open()?;
        let format = source.configure(&request(AcquisitionMode::OnDemand))?;
        assert_eq!(format.mode, AcquisitionMode::FreeRun);
        Ok(())
    }

    #[test]
    fn software_trigger_yields_one_frame() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::manual(PixelEncoding::Mono8, 4, 2));
        source.open()?;
        source.configure(&request(AcquisitionMode::OnDemand))?;
        source.start_grabbing()?;
        let control = source.control();

        source.trigger_once()?;
        assert!(source.retrieve_latest(Duration::from_millis(100))?.succeeded());
        assert_eq!(control.trigger_count(), 1);
        assert!(matches!(
            source.retrieve_latest(Duration::from_millis(20)),
            Err(SourceError::Timeout(_))
        ));
        Ok(())
    }

    #[test]
    fn hardware_trigger_only_fires_in_trigger_mode() -> Result<()> {
        let mut source = manual_source(PixelEncoding::Mono8)?;
        let control = source.control();
        source.start_grabbing()?;
        assert_eq!(control.fire_hardware_trigger(), None);
        source.stop_grabbing()?;

        source.configure(&request(AcquisitionMode::HardwareTrigger))?;
        source.start_grabbing()?;
        assert!(control.fire_hardware_trigger().is_some());
        assert!(source.retrieve_latest(Duration::from_millis(100))?.succeeded());
        Ok(())
    }

    #[test]
    fn injected_failure_is_reported_once() -> Result<()> {
        let mut source = manual_source(PixelEncoding::Mono8)?;
        let control = source.control();
        source.start_grabbing()?;
        control.fail_next_grabs(1);
        control.push_generated();

        match source.retrieve_latest(Duration::from_millis(100))? {
            GrabResult::Failed { code, .. } => assert_eq!(code, SYNTHETIC_GRAB_FAILURE),
            GrabResult::Succeeded(_) => panic!("expected injected failure"),
        }
        assert!(source.retrieve_latest(Duration::from_millis(100))?.succeeded());
        Ok(())
    }

    #[test]
    fn unplug_wakes_retrieval_with_device_removed() -> Result<()> {
        let mut source = manual_source(PixelEncoding::Mono8)?;
        let control = source.control();
        source.start_grabbing()?;

        let unplugger = control.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            unplugger.unplug();
        });
        assert!(matches!(
            source.retrieve_latest(Duration::from_secs(5)),
            Err(SourceError::DeviceRemoved)
        ));
        handle.join().map_err(|_| anyhow::anyhow!("unplug thread panicked"))?;

        assert!(!source.is_device_present());
        assert!(source.is_grabbing());
        source.stop_grabbing()?;
        assert!(!control.is_grabbing());
        Ok(())
    }

    #[test]
    fn open_fails_while_unplugged_and_close_is_idempotent() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::default());
        source.control().unplug();
        assert!(matches!(source.open(), Err(SourceError::NotFound(_))));

        source.control().replug();
        source.open()?;
        source.close()?;
        source.close()?;
        assert!(!source.is_open());
        Ok(())
    }

    #[test]
    fn odd_nv12_geometry_is_rejected() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::manual(PixelEncoding::Nv12, 3, 3));
        source.open()?;
        assert!(matches!(
            source.configure(&CaptureRequest::default()),
            Err(SourceError::Unsupported(_))
        ));
        Ok(())
    }
}
