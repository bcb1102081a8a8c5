//! Downstream graphs for one or two source bins, and the bus loop that runs them.

use anyhow::{anyhow, bail, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use std::sync::mpsc::{Receiver, TryRecvError};

/// H.264 encoders in order of preference: hardware first.
const H264_ENCODERS: [&str; 3] = ["omxh264enc", "imxvpuenc_h264", "x264enc"];

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .with_context(|| format!("create {factory}"))
}

/// First available H.264 encoder.
pub fn h264_encoder() -> Result<gst::Element> {
    for factory in H264_ENCODERS {
        let Ok(encoder) = gst::ElementFactory::make(factory).build() else {
            log::debug!("Pipeline: {} not available", factory);
            continue;
        };
        if factory == "x264enc" {
            encoder.set_property_from_str("speed-preset", "ultrafast");
        }
        log::info!("Pipeline: using {} for H.264", factory);
        return Ok(encoder);
    }
    bail!("no H.264 encoder found (tried {})", H264_ENCODERS.join(", "))
}

/// Builds exactly one downstream graph into a pipeline.
pub struct PipelineHelper {
    pipeline: gst::Pipeline,
    built: bool,
}

impl PipelineHelper {
    pub fn new(pipeline: gst::Pipeline) -> Self {
        Self {
            pipeline,
            built: false,
        }
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    fn claim(&mut self, what: &str) -> Result<()> {
        if self.built {
            bail!("pipeline already built, cannot add {what}");
        }
        self.built = true;
        Ok(())
    }

    /// Add `source` followed by `tail` and link them in order.
    fn chain(&self, source: &gst::Bin, tail: &[gst::Element]) -> Result<()> {
        self.pipeline
            .add(source)
            .context("add source bin to pipeline")?;
        self.pipeline
            .add_many(tail)
            .context("add elements to pipeline")?;
        let first = tail.first().context("pipeline tail is empty")?;
        source.link(first).context("link source bin")?;
        gst::Element::link_many(tail).context("link pipeline elements")?;
        Ok(())
    }

    /// `videoconvert ! autovideosink`
    pub fn display(&mut self, source: &gst::Bin) -> Result<()> {
        self.claim("display")?;
        self.chain(source, &[make("videoconvert")?, make("autovideosink")?])?;
        log::info!("Pipeline: display");
        Ok(())
    }

    /// `videoconvert ! fbdevsink device=...`
    pub fn framebuffer(&mut self, source: &gst::Bin, device: &str) -> Result<()> {
        self.claim("framebuffer")?;
        let sink = make("fbdevsink")?;
        sink.set_property("device", device);
        self.chain(source, &[make("videoconvert")?, sink])?;
        log::info!("Pipeline: framebuffer {}", device);
        Ok(())
    }

    /// `videoconvert ! encoder ! h264 caps ! rtph264pay ! udpsink`
    pub fn h264_stream(&mut self, source: &gst::Bin, host: &str, port: u16) -> Result<()> {
        self.claim("h264 stream")?;
        let filter = make("capsfilter")?;
        filter.set_property(
            "caps",
            gst::Caps::builder("video/x-h264")
                .field("stream-format", "byte-stream")
                .field("profile", "high")
                .build(),
        );
        let sink = make("udpsink")?;
        sink.set_property("host", host);
        sink.set_property("port", i32::from(port));
        sink.set_property("sync", false);
        sink.set_property("async", false);
        self.chain(
            source,
            &[
                make("videoconvert")?,
                h264_encoder()?,
                filter,
                make("rtph264pay")?,
                sink,
            ],
        )?;
        log::info!("Pipeline: streaming H.264 over RTP to {}:{}", host, port);
        Ok(())
    }

    /// `videoconvert ! encoder ! qtmux ! filesink`. The file is finalized on
    /// end-of-stream, so the bridge needs a frame limit or a Ctrl-C.
    pub fn h264_file(&mut self, source: &gst::Bin, path: &str) -> Result<()> {
        self.claim("h264 file")?;
        let sink = make("filesink")?;
        sink.set_property("location", path);
        self.chain(
            source,
            &[
                make("videoconvert")?,
                h264_encoder()?,
                make("h264parse")?,
                make("qtmux")?,
                sink,
            ],
        )?;
        log::info!("Pipeline: recording H.264 to {}", path);
        Ok(())
    }

    /// Two sources side by side through `compositor`, at `frame_rate`.
    pub fn side_by_side(
        &mut self,
        left: &gst::Bin,
        right: &gst::Bin,
        left_width: u32,
        frame_rate: gst::Fraction,
    ) -> Result<()> {
        self.claim("side-by-side compositor")?;
        let compositor = make("compositor")?;
        let rate = make("capsfilter")?;
        rate.set_property(
            "caps",
            gst::Caps::builder("video/x-raw")
                .field("framerate", frame_rate)
                .build(),
        );
        let convert = make("videoconvert")?;
        let sink = make("autovideosink")?;

        self.pipeline
            .add_many([left.upcast_ref::<gst::Element>(), right.upcast_ref()])
            .context("add source bins to pipeline")?;
        self.pipeline
            .add_many([&compositor, &rate, &convert, &sink])
            .context("add compositor elements")?;

        for (bin, xpos) in [(left, 0), (right, left_width as i32)] {
            let sink_pad = compositor
                .request_pad_simple("sink_%u")
                .context("request compositor sink pad")?;
            sink_pad.set_property("xpos", xpos);
            let src_pad = bin
                .static_pad("src")
                .with_context(|| format!("{} has no src pad", bin.name()))?;
            src_pad
                .link(&sink_pad)
                .map_err(|err| anyhow!("link {} to compositor: {:?}", bin.name(), err))?;
        }
        gst::Element::link_many([&compositor, &rate, &convert, &sink])
            .context("link compositor output")?;
        log::info!(
            "Pipeline: side by side at {}/{} fps",
            frame_rate.numer(),
            frame_rate.denom()
        );
        Ok(())
    }
}

/// Highest frame rate every source can deliver.
pub fn common_frame_rate(rates: &[f64]) -> Option<f64> {
    rates
        .iter()
        .copied()
        .filter(|rate| *rate > 0.0)
        .min_by(|a, b| a.total_cmp(b))
}

/// Why `run_pipeline` returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEnd {
    EndOfStream,
    Error(String),
}

/// Play `pipeline` until end-of-stream or error.
///
/// A message on `shutdown` sends end-of-stream into the pipeline so muxers can
/// finish; the loop then waits for it to reach the sinks. The pipeline is set
/// back to Null before returning.
pub fn run_pipeline(pipeline: &gst::Pipeline, shutdown: &Receiver<()>) -> Result<PipelineEnd> {
    let bus = pipeline.bus().context("pipeline has no bus")?;
    pipeline
        .set_state(gst::State::Playing)
        .context("set pipeline to Playing")?;
    log::info!("Pipeline: playing");

    let mut eos_sent = false;
    let end = loop {
        if !eos_sent {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    log::info!("Pipeline: shutdown requested, sending end of stream");
                    if !pipeline.send_event(gst::event::Eos::new()) {
                        log::warn!("Pipeline: end of stream event was not handled");
                    }
                    eos_sent = true;
                }
                Err(TryRecvError::Empty) => {}
            }
        }

        let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
            continue;
        };
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Eos(..) => {
                log::info!("Pipeline: end of stream");
                break PipelineEnd::EndOfStream;
            }
            MessageView::Error(err) => {
                let description = format!(
                    "gstreamer error from {:?}: {} ({:?})",
                    err.src().map(|s| s.path_string()),
                    err.error(),
                    err.debug()
                );
                log::error!("Pipeline: {}", description);
                break PipelineEnd::Error(description);
            }
            MessageView::Warning(warning) => {
                log::warn!("Pipeline: {}", warning.error());
            }
            _ => {}
        }
    };

    pipeline
        .set_state(gst::State::Null)
        .context("set pipeline to Null")?;
    Ok(end)
}
