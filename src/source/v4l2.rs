//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for local Video4Linux2 devices
//! (e.g. /dev/video0).
//!
//! The grab engine is a capture thread that owns its own handle and mmap
//! stream and drops every dequeued buffer into a `LatestImageSlot`. V4L2 has no
//! generic trigger control, so trigger requests fall back to freerun.

use ouroboros::self_referencing;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::latest::{LatestImageSlot, Take};
use super::{AcquisitionMode, CaptureFormat, CaptureRequest, DeviceInfo, FrameSource, SourceError};
use crate::frame::{GrabResult, GrabStatus, OwnedFrame, PixelEncoding};

const STREAM_BUFFERS: u32 = 4;

/// Incomplete buffer (fewer bytes than the negotiated format needs).
pub const V4L2_SHORT_BUFFER: u32 = 1;

/// Map a V4L2 fourcc to the encoding it carries.
pub fn encoding_for_fourcc(fourcc: &[u8; 4]) -> Option<PixelEncoding> {
    match fourcc {
        b"GREY" => Some(PixelEncoding::Mono8),
        b"Y10 " => Some(PixelEncoding::Mono10),
        b"Y12 " => Some(PixelEncoding::Mono12),
        b"Y16 " => Some(PixelEncoding::Mono16),
        b"RGB3" => Some(PixelEncoding::Rgb8),
        b"BGR3" => Some(PixelEncoding::Bgr8),
        b"YUYV" => Some(PixelEncoding::Yuyv),
        b"UYVY" => Some(PixelEncoding::Uyvy),
        b"NV12" => Some(PixelEncoding::Nv12),
        b"RGGB" => Some(PixelEncoding::BayerRg8),
        b"BA81" => Some(PixelEncoding::BayerBg8),
        b"GRBG" => Some(PixelEncoding::BayerGr8),
        b"GBRG" => Some(PixelEncoding::BayerGb8),
        _ => None,
    }
}

/// Drop per-line padding from a buffer.
///
/// NV12 is the Y plane followed by the interleaved UV plane at the same
/// stride, so it is `height * 3 / 2` lines of `width` bytes.
/// Returns `None` if the buffer is shorter than the format needs.
fn compact_rows(
    buf: &[u8],
    encoding: PixelEncoding,
    width: u32,
    height: u32,
    stride: u32,
) -> Option<Vec<u8>> {
    let expected = encoding.frame_len(width, height)?;
    let row_bytes = match encoding {
        PixelEncoding::Nv12 => width as usize,
        _ => expected / height.max(1) as usize,
    };
    let stride = stride as usize;
    if row_bytes == 0 || stride <= row_bytes {
        return buf.get(..expected).map(<[u8]>::to_vec);
    }
    let mut pixels = Vec::with_capacity(expected);
    for row in 0..expected / row_bytes {
        let start = row * stride;
        pixels.extend_from_slice(buf.get(start..start + row_bytes)?);
    }
    Some(pixels)
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn open_stream(path: &str) -> std::io::Result<DeviceV4l2State> {
    use v4l::buffer::Type;

    let device = v4l::Device::with_path(path)?;
    DeviceV4l2StateTryBuilder {
        device,
        stream_builder: |device| {
            v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
        },
    }
    .try_build()
}

pub struct V4l2Source {
    path: String,
    device: Option<v4l::Device>,
    info: DeviceInfo,
    format: Option<CaptureFormat>,
    stride: u32,
    slot: Arc<LatestImageSlot>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    current: Option<OwnedFrame>,
}

impl V4l2Source {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let slot = LatestImageSlot::new();
        slot.halt();
        Self {
            info: DeviceInfo {
                friendly_name: path.clone(),
                device_class: "V4L2".to_string(),
                serial: String::new(),
            },
            path,
            device: None,
            format: None,
            stride: 0,
            slot: Arc::new(slot),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            current: None,
        }
    }

    fn device(&self) -> Result<&v4l::Device, SourceError> {
        self.device.as_ref().ok_or(SourceError::NotOpen)
    }
}

impl FrameSource for V4l2Source {
    fn open(&mut self) -> Result<(), SourceError> {
        if !Path::new(&self.path).exists() {
            return Err(SourceError::NotFound(self.path.clone()));
        }
        let device = v4l::Device::with_path(&self.path)
            .map_err(|err| SourceError::io(format!("open v4l2 device {}", self.path), err))?;
        match device.query_caps() {
            Ok(caps) => {
                self.info.friendly_name = caps.card;
                self.info.device_class = format!("V4L2/{}", caps.driver);
                self.info.serial = caps.bus;
            }
            Err(err) => log::warn!(
                "V4l2Source: failed to query capabilities of {}: {}",
                self.path,
                err
            ),
        }
        self.device = Some(device);
        log::info!("V4l2Source: opened {} ({})", self.path, self.info.friendly_name);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if self.device.is_none() {
            return Ok(());
        }
        self.stop_grabbing()?;
        self.device = None;
        self.current = None;
        log::info!("V4l2Source: closed {}", self.path);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn configure(&mut self, request: &CaptureRequest) -> Result<CaptureFormat, SourceError> {
        use v4l::video::Capture;

        if self.is_grabbing() {
            return Err(SourceError::Unsupported(
                "reconfiguring while grabbing".to_string(),
            ));
        }
        let path = self.path.clone();
        let device = self.device()?;

        let mut format = device
            .format()
            .map_err(|err| SourceError::io("read v4l2 format", err))?;
        if let Some(width) = request.width {
            format.width = width;
        }
        if let Some(height) = request.height {
            format.height = height;
        }
        if encoding_for_fourcc(&format.fourcc.repr).is_none() {
            format.fourcc = v4l::FourCC::new(b"YUYV");
        }

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .map_err(|err| SourceError::io("read v4l2 format after set failure", err))?
            }
        };
        let encoding = encoding_for_fourcc(&format.fourcc.repr).ok_or_else(|| {
            SourceError::Unsupported(format!("v4l2 fourcc {:?}", format.fourcc.str()))
        })?;
        let frame_len = encoding
            .frame_len(format.width, format.height)
            .filter(|&len| len > 0)
            .ok_or_else(|| {
                SourceError::Unsupported(format!(
                    "{} at {}x{}",
                    encoding, format.width, format.height
                ))
            })?;

        let mut wanted_rate = request.frame_rate;
        if let Some(limit) = request.throughput_limit {
            let bandwidth_rate = limit as f64 / frame_len as f64;
            if wanted_rate.map_or(true, |rate| bandwidth_rate < rate) {
                log::info!(
                    "V4l2Source: {} limited to {:.2} fps by throughput limit of {} B/s",
                    path,
                    bandwidth_rate,
                    limit
                );
                wanted_rate = Some(bandwidth_rate);
            }
        }
        if let Some(rate) = wanted_rate {
            let params = v4l::video::capture::Parameters::with_fps(rate.round().max(1.0) as u32);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", path, err);
            }
        }
        let frame_rate = match device.params() {
            Ok(params) if params.interval.numerator > 0 => {
                params.interval.denominator as f64 / params.interval.numerator as f64
            }
            _ => wanted_rate.unwrap_or(0.0),
        };

        let mut mode = request.mode;
        if mode != AcquisitionMode::FreeRun {
            log::warn!(
                "V4l2Source: {} has no trigger support, using freerun instead of {}",
                path,
                mode
            );
            mode = AcquisitionMode::FreeRun;
        }

        let applied = CaptureFormat {
            width: format.width,
            height: format.height,
            encoding,
            frame_rate,
            mode,
        };
        self.stride = format.stride;
        self.format = Some(applied.clone());
        log::info!(
            "V4l2Source: configured {} for {}x{} {} at {:.2} fps",
            path,
            applied.width,
            applied.height,
            applied.encoding,
            applied.frame_rate
        );
        Ok(applied)
    }

    fn start_grabbing(&mut self) -> Result<(), SourceError> {
        self.device()?;
        let format = self.format.clone().ok_or(SourceError::NotConfigured)?;
        if self.is_grabbing() {
            return Ok(());
        }

        self.slot.reopen();
        self.running.store(true, Ordering::SeqCst);
        let path = self.path.clone();
        let stride = self.stride;
        let slot = self.slot.clone();
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("v4l2-grab".to_string())
            .spawn(move || capture_loop(&path, &format, stride, &slot, &running))
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                SourceError::io("spawn v4l2 grab thread", err)
            })?;
        self.worker = Some(handle);
        log::debug!("V4l2Source: {} grabbing", self.path);
        Ok(())
    }

    fn stop_grabbing(&mut self) -> Result<(), SourceError> {
        self.running.store(false, Ordering::SeqCst);
        self.slot.halt();
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| SourceError::Driver("v4l2 grab thread panicked".to_string()))?;
            log::debug!("V4l2Source: {} stopped grabbing", self.path);
        }
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn retrieve_latest(&mut self, timeout: Duration) -> Result<GrabResult<'_>, SourceError> {
        self.device()?;
        if !self.is_grabbing() {
            return Err(SourceError::NotGrabbing);
        }
        match self.slot.take(timeout) {
            Take::Frame(frame) => {
                let frame = self.current.insert(frame);
                Ok(GrabResult::from_owned(frame))
            }
            Take::TimedOut => Err(SourceError::Timeout(timeout)),
            Take::Halted if !self.is_device_present() => Err(SourceError::DeviceRemoved),
            Take::Halted => Err(SourceError::Driver(format!(
                "capture on {} ended",
                self.path
            ))),
        }
    }

    fn trigger_once(&mut self) -> Result<(), SourceError> {
        Err(SourceError::Unsupported(
            "software trigger on v4l2 devices".to_string(),
        ))
    }

    fn is_device_present(&self) -> bool {
        Path::new(&self.path).exists()
    }

    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("V4l2Source: close on drop failed: {}", err);
        }
    }
}

/// Capture thread body. Halts the slot when the stream ends so a waiting
/// retrieval wakes up instead of running into its timeout.
fn capture_loop(
    path: &str,
    format: &CaptureFormat,
    stride: u32,
    slot: &LatestImageSlot,
    running: &AtomicBool,
) {
    use v4l::io::traits::CaptureStream;

    let mut state = match open_stream(path) {
        Ok(state) => state,
        Err(err) => {
            log::error!("V4l2Source: failed to start stream on {}: {}", path, err);
            slot.halt();
            return;
        }
    };

    let mut sequence = 0u64;
    while running.load(Ordering::SeqCst) {
        let captured = state.with_mut(|fields| {
            fields.stream.next().map(|(buf, _meta)| {
                compact_rows(buf, format.encoding, format.width, format.height, stride)
            })
        });
        match captured {
            Ok(pixels) => {
                sequence += 1;
                let frame = match pixels {
                    Some(data) => OwnedFrame::succeeded(
                        format.encoding,
                        format.width,
                        format.height,
                        sequence,
                        data,
                    ),
                    None => OwnedFrame {
                        encoding: format.encoding,
                        width: format.width,
                        height: format.height,
                        sequence,
                        status: GrabStatus::Failed {
                            code: V4L2_SHORT_BUFFER,
                            description: "short v4l2 buffer".to_string(),
                        },
                        data: Vec::new(),
                    },
                };
                slot.put(frame);
            }
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if !Path::new(path).exists() {
                    log::warn!("V4l2Source: {} disappeared: {}", path, err);
                    slot.halt();
                    break;
                }
                log::warn!("V4l2Source: capture error on {}: {}", path, err);
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
