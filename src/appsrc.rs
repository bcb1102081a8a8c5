//! GStreamer `appsrc` shim.
//!
//! The bridge never sees GStreamer. This module wires the two together:
//! `need-data` calls the demand closure, published buffers are copied into
//! `gst::Buffer`s and pushed, end-of-stream maps to `appsrc.end_of_stream()`.
//!
//! The source side is packaged as a bin:
//!
//! ```text
//! appsrc ! videoscale ! capsfilter ! videoflip  ->  ghost "src" pad
//! ```

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::bridge::SharedBridge;
use crate::config::PostProcess;
use crate::consumer::{demand_callback, FrameHandoff};
use crate::frame::{OutputEncoding, PublishedFrame};
use crate::source::FrameSource;

/// Pushes published frames into an `appsrc`.
pub struct AppSrcHandoff {
    appsrc: gst_app::AppSrc,
}

impl FrameHandoff for AppSrcHandoff {
    fn publish(&mut self, frame: PublishedFrame<'_>) {
        let buffer = gst::Buffer::from_mut_slice(frame.bytes().to_vec());
        if let Err(err) = self.appsrc.push_buffer(buffer) {
            log::warn!(
                "AppSrcHandoff: {} rejected buffer: {:?}",
                self.appsrc.name(),
                err
            );
        }
    }

    fn end_of_stream(&mut self) {
        // Flushing once the pipeline is already down.
        if let Err(err) = self.appsrc.end_of_stream() {
            log::debug!(
                "AppSrcHandoff: {} rejected end of stream: {:?}",
                self.appsrc.name(),
                err
            );
        }
    }
}

/// Create a live, time-formatted `appsrc` and the handoff that feeds it.
///
/// Caps are set later by `source_bin`, once the bridge knows its format.
pub fn appsrc(name: &str) -> Result<(gst_app::AppSrc, AppSrcHandoff)> {
    gst::init().context("initialize gstreamer")?;

    let appsrc = gst_app::AppSrc::builder().name(name).build();
    appsrc.set_stream_type(gst_app::AppStreamType::Stream);
    appsrc.set_property("format", gst::Format::Time);
    appsrc.set_property("is-live", true);
    appsrc.set_property("do-timestamp", true);

    let handoff = AppSrcHandoff {
        appsrc: appsrc.clone(),
    };
    Ok((appsrc, handoff))
}

/// Caps framerate for a possibly fractional rate.
pub fn caps_framerate(frame_rate: f64) -> gst::Fraction {
    if frame_rate.fract() == 0.0 {
        gst::Fraction::new(frame_rate as i32, 1)
    } else {
        gst::Fraction::new((frame_rate * 1000.0).round() as i32, 1000)
    }
}

fn video_format(encoding: OutputEncoding) -> gst_video::VideoFormat {
    match encoding {
        OutputEncoding::Rgb24 => gst_video::VideoFormat::Rgb,
        OutputEncoding::Gray8 => gst_video::VideoFormat::Gray8,
    }
}

/// Geometry and post-processing read from an initialized bridge.
#[derive(Clone, Copy, Debug)]
pub struct SourceGeometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub encoding: OutputEncoding,
    pub frame_limit: Option<u64>,
    pub post: PostProcess,
}

impl SourceGeometry {
    /// Size leaving the bin, after rescale and rotation.
    pub fn output_size(&self) -> (u32, u32) {
        let (width, height) = match self.post.rescale {
            Some(rescale) => (rescale.width, rescale.height),
            None => (self.width, self.height),
        };
        if self.post.rotation.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

fn geometry<S: FrameSource>(bridge: &SharedBridge<S>) -> Result<SourceGeometry> {
    let bridge = bridge
        .lock()
        .map_err(|_| anyhow!("bridge lock poisoned"))?;
    let (Some(width), Some(height), Some(frame_rate), Some(encoding)) = (
        bridge.width(),
        bridge.height(),
        bridge.frame_rate(),
        bridge.output_encoding(),
    ) else {
        return Err(anyhow!(
            "bridge must be initialized before building its source bin, bridge is {}",
            bridge.state()
        ));
    };
    Ok(SourceGeometry {
        width,
        height,
        frame_rate,
        encoding,
        frame_limit: bridge.frame_limit(),
        post: bridge.post_process(),
    })
}

/// Build the source bin around `appsrc` for an initialized bridge and
/// register the bridge's demand closure as `need-data`.
pub fn source_bin<S>(
    name: &str,
    appsrc: &gst_app::AppSrc,
    bridge: &SharedBridge<S>,
) -> Result<(gst::Bin, SourceGeometry)>
where
    S: FrameSource + 'static,
{
    let geometry = geometry(bridge)?;

    let caps = gst_video::VideoCapsBuilder::new()
        .format(video_format(geometry.encoding))
        .width(geometry.width as i32)
        .height(geometry.height as i32)
        .framerate(caps_framerate(geometry.frame_rate))
        .build();
    appsrc.set_caps(Some(&caps));
    let num_buffers = geometry
        .frame_limit
        .and_then(|limit| i32::try_from(limit).ok())
        .unwrap_or(-1);
    appsrc.set_property("num-buffers", num_buffers);

    let demand = demand_callback(bridge.clone());
    appsrc.set_callbacks(
        gst_app::AppSrcCallbacks::builder()
            .need_data(move |_appsrc, _length| {
                demand();
            })
            .build(),
    );

    let bin = gst::Bin::builder().name(name).build();
    let scale = gst::ElementFactory::make("videoscale")
        .build()
        .context("create videoscale")?;
    let filter = gst::ElementFactory::make("capsfilter")
        .build()
        .context("create capsfilter")?;
    if let Some(rescale) = geometry.post.rescale {
        let scaled = gst_video::VideoCapsBuilder::new()
            .width(rescale.width as i32)
            .height(rescale.height as i32)
            .build();
        filter.set_property("caps", &scaled);
    }
    let flip = gst::ElementFactory::make("videoflip")
        .build()
        .context("create videoflip")?;
    flip.set_property_from_str("method", geometry.post.rotation.videoflip_method());

    let elements = [appsrc.upcast_ref::<gst::Element>(), &scale, &filter, &flip];
    bin.add_many(elements)
        .context("add source elements to bin")?;
    gst::Element::link_many(elements).context("link source elements")?;

    let flip_src = flip
        .static_pad("src")
        .context("videoflip has no src pad")?;
    let ghost = gst::GhostPad::builder_with_target(&flip_src)
        .context("create ghost pad")?
        .name("src")
        .build();
    bin.add_pad(&ghost).context("add ghost pad to source bin")?;

    log::info!(
        "AppSrc: {} {}x{} {} at {:.2} fps, rescale {:?}, rotation {}",
        name,
        geometry.width,
        geometry.height,
        geometry.encoding,
        geometry.frame_rate,
        geometry.post.rescale,
        geometry.post.rotation.degrees()
    );
    Ok((bin, geometry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Rescale, Rotation};

    #[test]
    fn integral_rates_stay_integral() {
        assert_eq!(caps_framerate(30.0), gst::Fraction::new(30, 1));
        assert_eq!(caps_framerate(29.97), gst::Fraction::new(29970, 1000));
    }

    #[test]
    fn output_size_follows_rescale_and_rotation() {
        let geometry = SourceGeometry {
            width: 640,
            height: 480,
            frame_rate: 30.0,
            encoding: OutputEncoding::Rgb24,
            frame_limit: None,
            post: PostProcess {
                rescale: Some(Rescale {
                    width: 320,
                    height: 240,
                }),
                rotation: Rotation::Clockwise90,
            },
        };
        assert_eq!(geometry.output_size(), (240, 320));
    }
}
