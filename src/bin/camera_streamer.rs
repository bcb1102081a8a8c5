//! camera_streamer - stream a camera through the acquisition bridge
//!
//! This binary:
//! 1. Loads layered settings (defaults, CAMERA_APPSRC_CONFIG file, env, flags)
//! 2. Opens one bridge per camera (two for the side-by-side pipeline)
//! 3. Attaches each bridge to an appsrc bin and finishes the pipeline, or
//!    pulls frames headless for the `null` pipeline
//! 4. On Ctrl-C sends end-of-stream downstream, then stops and closes the bridges

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::MutexGuard;

use camera_appsrc::config::{parse_encoding, PipelineKind, USB2_THROUGHPUT_LIMIT};
use camera_appsrc::source::source_for_uri;
use camera_appsrc::{
    demand_callback, AcquisitionBridge, BridgeConfig, BridgeState, CountingHandoff, FrameHandoff,
    FrameSource, PullDriver, SharedBridge, StreamerConfig,
};

type CameraBridge = SharedBridge<Box<dyn FrameSource>>;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera: stub://NAME for the synthetic camera, /dev/videoN for V4L2.
    #[arg(long, env = "CAMERA_APPSRC_DEVICE")]
    device: Option<String>,
    /// Second camera for the side-by-side pipeline.
    #[arg(long)]
    second_device: Option<String>,
    /// Pixel encoding of the synthetic camera (Mono8, RGB8, YUYV, BayerRG8, ...).
    #[arg(long)]
    encoding: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Frame rate; defaults to the device maximum.
    #[arg(long)]
    fps: Option<f64>,
    /// Trigger one frame per demand.
    #[arg(long)]
    on_demand: bool,
    /// Capture on the hardware trigger line. Ignored with --on-demand.
    #[arg(long)]
    hardware_trigger: bool,
    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,
    #[arg(long)]
    rescale_width: Option<u32>,
    #[arg(long)]
    rescale_height: Option<u32>,
    /// Clockwise rotation: 0, 90, 180 or 270.
    #[arg(long, allow_negative_numbers = true)]
    rotation: Option<i32>,
    /// Per-retrieval timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Transport budget in bytes per second.
    #[arg(long)]
    throughput_limit: Option<u64>,
    /// Limit throughput to what a USB 2.0 link sustains.
    #[arg(long)]
    usb2: bool,
    /// display, framebuffer, h264stream, h264file, sidebyside or null.
    #[arg(long)]
    pipeline: Option<PipelineKind>,
    /// Framebuffer device, stream host or output file.
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

impl Args {
    fn apply(&self, config: &mut StreamerConfig) -> Result<()> {
        if let Some(device) = &self.device {
            config.device.uri = device.clone();
        }
        if let Some(second) = &self.second_device {
            config.device.second_uri = Some(second.clone());
        }
        if let Some(encoding) = &self.encoding {
            config.device.encoding = parse_encoding(encoding)?;
        }

        let bridge = &mut config.bridge;
        bridge.width = self.width.or(bridge.width);
        bridge.height = self.height.or(bridge.height);
        bridge.frame_rate = self.fps.or(bridge.frame_rate);
        bridge.on_demand |= self.on_demand;
        bridge.hardware_trigger |= self.hardware_trigger;
        bridge.frame_limit = self.frames.or(bridge.frame_limit);
        bridge.rescale_width = self.rescale_width.or(bridge.rescale_width);
        bridge.rescale_height = self.rescale_height.or(bridge.rescale_height);
        bridge.rotation = self.rotation.or(bridge.rotation);
        if let Some(timeout_ms) = self.timeout_ms {
            bridge.retrieve_timeout = std::time::Duration::from_millis(timeout_ms);
        }
        if self.usb2 {
            bridge.throughput_limit = Some(USB2_THROUGHPUT_LIMIT);
        }
        bridge.throughput_limit = self.throughput_limit.or(bridge.throughput_limit);

        if let Some(kind) = self.pipeline {
            config.pipeline.kind = kind;
        }
        if let Some(target) = &self.target {
            config.pipeline.target = Some(target.clone());
        }
        if let Some(port) = self.port {
            config.pipeline.port = port;
        }
        Ok(())
    }
}

/// Everything one streaming run owns. Dropped bridges close themselves, so an
/// early error return still releases the cameras.
struct StreamContext {
    bridges: Vec<CameraBridge>,
}

impl StreamContext {
    fn new() -> Self {
        Self {
            bridges: Vec::new(),
        }
    }

    fn add_bridge(
        &mut self,
        uri: &str,
        config: &StreamerConfig,
        bridge_config: &BridgeConfig,
        handoff: impl FrameHandoff + 'static,
    ) -> Result<CameraBridge> {
        let source = source_for_uri(uri, config.device.encoding)?;
        let mut bridge = AcquisitionBridge::new(source, handoff);
        bridge
            .initialize(bridge_config)
            .with_context(|| format!("initialize camera {uri}"))?;
        if let Some(info) = bridge.device_info() {
            log::info!("camera_streamer: using {}", info);
        }
        let shared = bridge.shared();
        self.bridges.push(shared.clone());
        Ok(shared)
    }

    fn start_all(&self) -> Result<()> {
        for bridge in &self.bridges {
            lock(bridge)?.start()?;
        }
        Ok(())
    }

    /// Stop (end-of-stream first) and close every bridge.
    fn shutdown(&self) -> Result<()> {
        for bridge in &self.bridges {
            let mut bridge = lock(bridge)?;
            if matches!(bridge.state(), BridgeState::Grabbing | BridgeState::Stopped) {
                if let Err(err) = bridge.stop() {
                    log::warn!("camera_streamer: stop failed: {}", err);
                }
            }
            let stats = bridge.stats();
            bridge.close()?;
            log::info!(
                "camera_streamer: published {} ({} fresh, {} stale, {} transient failures)",
                stats.published,
                stats.fresh,
                stats.stale,
                stats.transient_failures
            );
        }
        Ok(())
    }
}

fn lock(bridge: &CameraBridge) -> Result<MutexGuard<'_, AcquisitionBridge<Box<dyn FrameSource>>>> {
    bridge.lock().map_err(|_| anyhow!("bridge lock poisoned"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = StreamerConfig::load_unvalidated()?;
    args.apply(&mut config)?;
    config.validate()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let mut context = StreamContext::new();
    let result = match config.pipeline.kind {
        PipelineKind::Null => run_headless(&config, &mut context, rx),
        kind => run_gstreamer(&config, kind, &mut context, rx),
    };
    let closed = context.shutdown();
    result.and(closed)
}

/// Pull frames without a media framework until Ctrl-C or end-of-stream.
fn run_headless(
    config: &StreamerConfig,
    context: &mut StreamContext,
    shutdown: Receiver<()>,
) -> Result<()> {
    let handoff = CountingHandoff::new();
    let bridge = context.add_bridge(
        &config.device.uri,
        config,
        &config.bridge_config_for(1),
        handoff.clone(),
    )?;
    let frame_rate = lock(&bridge)?.frame_rate().unwrap_or(0.0);
    context.start_all()?;

    let driver = PullDriver::new().paced(frame_rate);
    let stop = driver.stop_handle();
    std::thread::spawn(move || {
        if shutdown.recv().is_ok() {
            log::info!("camera_streamer: shutdown signal received");
            stop.store(true, Ordering::SeqCst);
        }
    });

    log::info!("camera_streamer: pulling frames headless (Ctrl-C to stop)");
    let summary = driver.run(demand_callback(bridge));
    log::info!(
        "camera_streamer: {} demands, {} bytes published, ended by {:?}",
        summary.demands,
        handoff.bytes(),
        summary.end
    );
    Ok(())
}

#[cfg(feature = "appsrc-gstreamer")]
fn run_gstreamer(
    config: &StreamerConfig,
    kind: PipelineKind,
    context: &mut StreamContext,
    shutdown: Receiver<()>,
) -> Result<()> {
    use camera_appsrc::appsrc::{appsrc, caps_framerate, source_bin};
    use camera_appsrc::pipeline::{common_frame_rate, run_pipeline, PipelineEnd, PipelineHelper};
    use gstreamer as gst;

    let uris = config.device_uris();
    let bridge_config = config.bridge_config_for(uris.len());
    let mut sources = Vec::with_capacity(uris.len());
    for (index, uri) in uris.iter().enumerate() {
        let (src, handoff) = appsrc(&format!("appsrc{index}"))?;
        let bridge = context.add_bridge(uri, config, &bridge_config, handoff)?;
        sources.push(source_bin(&format!("sourcebin{index}"), &src, &bridge)?);
    }

    let mut helper = PipelineHelper::new(gst::Pipeline::builder().name("pipeline").build());
    let target = config.pipeline.target.as_deref();
    match (kind, sources.as_slice()) {
        (PipelineKind::Display, [(bin, _), ..]) => helper.display(bin)?,
        (PipelineKind::Framebuffer, [(bin, _), ..]) => {
            helper.framebuffer(bin, target.context("framebuffer device missing")?)?
        }
        (PipelineKind::H264Stream, [(bin, _), ..]) => helper.h264_stream(
            bin,
            target.context("stream host missing")?,
            config.pipeline.port,
        )?,
        (PipelineKind::H264File, [(bin, _), ..]) => {
            helper.h264_file(bin, target.context("output path missing")?)?
        }
        (PipelineKind::SideBySide, [(left, left_geometry), (right, right_geometry)]) => {
            let rate = common_frame_rate(&[left_geometry.frame_rate, right_geometry.frame_rate])
                .context("cameras report no usable frame rate")?;
            helper.side_by_side(left, right, left_geometry.output_size().0, caps_framerate(rate))?
        }
        (kind, sources) => {
            return Err(anyhow!(
                "pipeline {} cannot be built from {} source(s)",
                kind,
                sources.len()
            ))
        }
    }

    context.start_all()?;
    match run_pipeline(helper.pipeline(), &shutdown)? {
        PipelineEnd::EndOfStream => Ok(()),
        PipelineEnd::Error(description) => Err(anyhow!(description)),
    }
}

#[cfg(not(feature = "appsrc-gstreamer"))]
fn run_gstreamer(
    _config: &StreamerConfig,
    kind: PipelineKind,
    _context: &mut StreamContext,
    _shutdown: Receiver<()>,
) -> Result<()> {
    Err(anyhow!(
        "pipeline {} requires the appsrc-gstreamer feature; use --pipeline null",
        kind
    ))
}
