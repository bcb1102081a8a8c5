//! Pixel normalization into the bridge's persistent buffer.
//!
//! Every conversion validates geometry and length first and only then writes,
//! so the target is either fully overwritten or left untouched.

use thiserror::Error;

use crate::frame::{NormalizedFrameBuffer, OutputEncoding, PixelEncoding, RawFrame};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("frame is {frame_width}x{frame_height} but buffer is {buffer_width}x{buffer_height}")]
    DimensionMismatch {
        frame_width: u32,
        frame_height: u32,
        buffer_width: u32,
        buffer_height: u32,
    },
    #[error("{encoding} frame geometry {width}x{height} is invalid")]
    InvalidGeometry {
        encoding: PixelEncoding,
        width: u32,
        height: u32,
    },
    #[error("{encoding} frame length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        encoding: PixelEncoding,
        expected: usize,
        actual: usize,
    },
    #[error("cannot normalize {from} into {to}")]
    Unsupported {
        from: PixelEncoding,
        to: OutputEncoding,
    },
}

/// How a frame reached the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversion {
    /// Source bytes already had the output layout.
    Copied,
    /// Colorspace conversion or demosaic.
    Converted,
}

/// Normalize `frame` into `target`, overwriting it completely.
pub fn normalize_into(
    frame: &RawFrame<'_>,
    target: &mut NormalizedFrameBuffer,
) -> Result<Conversion, NormalizeError> {
    if frame.width != target.width() || frame.height != target.height() {
        return Err(NormalizeError::DimensionMismatch {
            frame_width: frame.width,
            frame_height: frame.height,
            buffer_width: target.width(),
            buffer_height: target.height(),
        });
    }
    let expected = frame
        .encoding
        .frame_len(frame.width, frame.height)
        .ok_or(NormalizeError::InvalidGeometry {
            encoding: frame.encoding,
            width: frame.width,
            height: frame.height,
        })?;
    if frame.data.len() != expected {
        return Err(NormalizeError::LengthMismatch {
            encoding: frame.encoding,
            expected,
            actual: frame.data.len(),
        });
    }

    let output = target.encoding();
    if frame.encoding == output.matching_source() {
        target.bytes_mut().copy_from_slice(frame.data);
        target.mark_written(frame.sequence);
        return Ok(Conversion::Copied);
    }

    let w = frame.width as usize;
    let h = frame.height as usize;
    let src = frame.data;
    let dst = target.bytes_mut();
    match (output, frame.encoding) {
        (OutputEncoding::Gray8, PixelEncoding::Mono10)
        | (OutputEncoding::Gray8, PixelEncoding::Mono12)
        | (OutputEncoding::Gray8, PixelEncoding::Mono16) => {
            let shift = frame.encoding.mono_bits().unwrap_or(16) - 8;
            mono16_to_gray(src, dst, shift);
        }
        (OutputEncoding::Rgb24, PixelEncoding::Mono8) => gray_to_rgb(src, dst),
        (OutputEncoding::Rgb24, PixelEncoding::Mono10)
        | (OutputEncoding::Rgb24, PixelEncoding::Mono12)
        | (OutputEncoding::Rgb24, PixelEncoding::Mono16) => {
            let shift = frame.encoding.mono_bits().unwrap_or(16) - 8;
            for (pixel, sample) in dst.chunks_exact_mut(3).zip(src.chunks_exact(2)) {
                let value = scale_sample(sample, shift);
                pixel.fill(value);
            }
        }
        (OutputEncoding::Rgb24, PixelEncoding::Bgr8) => bgr_to_rgb(src, dst),
        (OutputEncoding::Rgb24, PixelEncoding::Yuyv) => packed422_to_rgb(src, dst, [0, 1, 2, 3]),
        (OutputEncoding::Rgb24, PixelEncoding::Uyvy) => packed422_to_rgb(src, dst, [1, 0, 3, 2]),
        (OutputEncoding::Rgb24, PixelEncoding::Nv12) => nv12_to_rgb(src, dst, w, h),
        (OutputEncoding::Rgb24, encoding) => match BayerPattern::of(encoding) {
            Some(pattern) => demosaic_bilinear(src, dst, w, h, pattern),
            None => {
                return Err(NormalizeError::Unsupported {
                    from: encoding,
                    to: output,
                })
            }
        },
        (OutputEncoding::Gray8, encoding) => {
            return Err(NormalizeError::Unsupported {
                from: encoding,
                to: output,
            })
        }
    }

    target.mark_written(frame.sequence);
    Ok(Conversion::Converted)
}

fn scale_sample(sample: &[u8], shift: u32) -> u8 {
    let value = u16::from_le_bytes([sample[0], sample[1]]);
    (value >> shift).min(255) as u8
}

fn mono16_to_gray(src: &[u8], dst: &mut [u8], shift: u32) {
    for (out, sample) in dst.iter_mut().zip(src.chunks_exact(2)) {
        *out = scale_sample(sample, shift);
    }
}

fn gray_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (pixel, &value) in dst.chunks_exact_mut(3).zip(src) {
        pixel.fill(value);
    }
}

fn bgr_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (out, bgr) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
        out[0] = bgr[2];
        out[1] = bgr[1];
        out[2] = bgr[0];
    }
}

/// `order` gives the byte offsets of `[Y0, U, Y1, V]` inside each 4-byte group.
fn packed422_to_rgb(src: &[u8], dst: &mut [u8], order: [usize; 4]) {
    for (out, group) in dst.chunks_exact_mut(6).zip(src.chunks_exact(4)) {
        let y0 = group[order[0]];
        let u = group[order[1]];
        let y1 = group[order[2]];
        let v = group[order[3]];
        out[..3].copy_from_slice(&yuv_to_rgb(y0, u, v));
        out[3..].copy_from_slice(&yuv_to_rgb(y1, u, v));
    }
}

fn nv12_to_rgb(src: &[u8], dst: &mut [u8], w: usize, h: usize) {
    let y_plane = w * h;
    for j in 0..h {
        for i in 0..w {
            let y = src[j * w + i];
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = src[uv_index];
            let v = src[uv_index + 1];

            let offset = (j * w + i) * 3;
            dst[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
}

/// BT.601 full-range YUV to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

// ----------------------------------------------------------------------------
// Bayer demosaic
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BayerPattern {
    Rg,
    Bg,
    Gr,
    Gb,
}

impl BayerPattern {
    fn of(encoding: PixelEncoding) -> Option<Self> {
        match encoding {
            PixelEncoding::BayerRg8 => Some(Self::Rg),
            PixelEncoding::BayerBg8 => Some(Self::Bg),
            PixelEncoding::BayerGr8 => Some(Self::Gr),
            PixelEncoding::BayerGb8 => Some(Self::Gb),
            _ => None,
        }
    }

    /// Channel (0 = R, 1 = G, 2 = B) sampled at `(x, y)`.
    fn channel_at(self, x: usize, y: usize) -> usize {
        let tile = match self {
            Self::Rg => [0, 1, 1, 2],
            Self::Bg => [2, 1, 1, 0],
            Self::Gr => [1, 0, 2, 1],
            Self::Gb => [1, 2, 0, 1],
        };
        tile[(y % 2) * 2 + (x % 2)]
    }
}

/// Bilinear demosaic: each missing channel is the mean of the same-channel
/// sites in the clamped 3x3 neighbourhood.
fn demosaic_bilinear(src: &[u8], dst: &mut [u8], w: usize, h: usize, pattern: BayerPattern) {
    for y in 0..h {
        for x in 0..w {
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];
            let own = pattern.channel_at(x, y);
            for dy in [-1isize, 0, 1] {
                for dx in [-1isize, 0, 1] {
                    let nx = clamp_index(x as isize + dx, w);
                    let ny = clamp_index(y as isize + dy, h);
                    let channel = pattern.channel_at(nx, ny);
                    if channel == own {
                        continue;
                    }
                    sums[channel] += u32::from(src[ny * w + nx]);
                    counts[channel] += 1;
                }
            }

            let offset = (y * w + x) * 3;
            for channel in 0..3 {
                dst[offset + channel] = if channel == own {
                    src[y * w + x]
                } else if counts[channel] == 0 {
                    0
                } else {
                    ((sums[channel] + counts[channel] / 2) / counts[channel]) as u8
                };
            }
        }
    }
}

fn clamp_index(value: isize, len: usize) -> usize {
    value.clamp(0, len as isize - 1) as usize
}
