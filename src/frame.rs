//! Frame model shared by sources, the bridge, and consumers.
//!
//! - `PixelEncoding`: what a source delivers.
//! - `OutputEncoding`: the two canonical encodings a bridge publishes (RGB24 or GRAY8).
//! - `RawFrame`: borrowed view of the grab engine's current frame. Valid until the next retrieval.
//! - `OwnedFrame`: what a grab engine keeps in its single output slot.
//! - `NormalizedFrameBuffer`: the one persistent buffer a bridge overwrites in place.
//! - `PublishedFrame`: the borrowed handle consumers receive during a publish.

use std::fmt;

/// Pixel encodings a source may deliver.
///
/// Multi-byte mono encodings are unpacked little-endian 16-bit samples.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    Mono8,
    Mono10,
    Mono12,
    Mono16,
    Rgb8,
    Bgr8,
    /// YUV 4:2:2 packed, `Y0 U Y1 V`.
    Yuyv,
    /// YUV 4:2:2 packed, `U Y0 V Y1`.
    Uyvy,
    /// YUV 4:2:0 semi-planar.
    Nv12,
    BayerRg8,
    BayerBg8,
    BayerGr8,
    BayerGb8,
}

impl PixelEncoding {
    pub fn is_mono(self) -> bool {
        matches!(
            self,
            Self::Mono8 | Self::Mono10 | Self::Mono12 | Self::Mono16
        )
    }

    /// Significant bits per mono sample, `None` for color encodings.
    pub fn mono_bits(self) -> Option<u32> {
        match self {
            Self::Mono8 => Some(8),
            Self::Mono10 => Some(10),
            Self::Mono12 => Some(12),
            Self::Mono16 => Some(16),
            _ => None,
        }
    }

    /// Canonical output encoding for a device currently delivering `self`.
    pub fn canonical_output(self) -> OutputEncoding {
        if self.is_mono() {
            OutputEncoding::Gray8
        } else {
            OutputEncoding::Rgb24
        }
    }

    /// Exact byte length of a `width` x `height` frame, `None` on overflow or
    /// when the geometry is impossible for the encoding (odd NV12 sizes).
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            Self::Mono8 | Self::BayerRg8 | Self::BayerBg8 | Self::BayerGr8 | Self::BayerGb8 => {
                Some(pixels)
            }
            Self::Mono10 | Self::Mono12 | Self::Mono16 | Self::Yuyv | Self::Uyvy => {
                pixels.checked_mul(2)
            }
            Self::Rgb8 | Self::Bgr8 => pixels.checked_mul(3),
            Self::Nv12 => {
                if width % 2 != 0 || height % 2 != 0 {
                    return None;
                }
                pixels.checked_add(pixels / 2)
            }
        }
    }

    /// Name used in configuration files and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono10 => "Mono10",
            Self::Mono12 => "Mono12",
            Self::Mono16 => "Mono16",
            Self::Rgb8 => "RGB8",
            Self::Bgr8 => "BGR8",
            Self::Yuyv => "YUYV",
            Self::Uyvy => "UYVY",
            Self::Nv12 => "NV12",
            Self::BayerRg8 => "BayerRG8",
            Self::BayerBg8 => "BayerBG8",
            Self::BayerGr8 => "BayerGR8",
            Self::BayerGb8 => "BayerGB8",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let all = [
            Self::Mono8,
            Self::Mono10,
            Self::Mono12,
            Self::Mono16,
            Self::Rgb8,
            Self::Bgr8,
            Self::Yuyv,
            Self::Uyvy,
            Self::Nv12,
            Self::BayerRg8,
            Self::BayerBg8,
            Self::BayerGr8,
            Self::BayerGb8,
        ];
        all.into_iter()
            .find(|encoding| encoding.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical encodings a bridge publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputEncoding {
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit grayscale.
    Gray8,
}

impl OutputEncoding {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Gray8 => 1,
        }
    }

    /// The source encoding whose bytes already match this output layout.
    pub fn matching_source(self) -> PixelEncoding {
        match self {
            Self::Rgb24 => PixelEncoding::Rgb8,
            Self::Gray8 => PixelEncoding::Mono8,
        }
    }

    /// GStreamer raw video format name.
    pub fn caps_format(self) -> &'static str {
        match self {
            Self::Rgb24 => "RGB",
            Self::Gray8 => "GRAY8",
        }
    }
}

impl fmt::Display for OutputEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.caps_format())
    }
}

// ----------------------------------------------------------------------------
// Frames owned by the grab engine
// ----------------------------------------------------------------------------

/// Outcome the grab engine attached to a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrabStatus {
    Succeeded,
    /// The engine delivered a buffer but flagged it as bad (incomplete transfer, CRC, ...).
    Failed { code: u32, description: String },
}

/// Frame as stored in a grab engine's output slot.
#[derive(Clone, Debug)]
pub struct OwnedFrame {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub status: GrabStatus,
    pub data: Vec<u8>,
}

impl OwnedFrame {
    pub fn succeeded(
        encoding: PixelEncoding,
        width: u32,
        height: u32,
        sequence: u64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            encoding,
            width,
            height,
            sequence,
            status: GrabStatus::Succeeded,
            data,
        }
    }

    /// Borrow as a `RawFrame`. The borrow ends at the next retrieval because
    /// sources hand these out from `&mut self`.
    pub fn view(&self) -> RawFrame<'_> {
        RawFrame {
            encoding: self.encoding,
            width: self.width,
            height: self.height,
            sequence: self.sequence,
            data: &self.data,
        }
    }
}

/// Borrowed view of a successfully grabbed frame.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame<'a> {
    pub encoding: PixelEncoding,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub data: &'a [u8],
}

/// What `FrameSource::retrieve_latest` hands back.
#[derive(Debug)]
pub enum GrabResult<'a> {
    Succeeded(RawFrame<'a>),
    Failed { code: u32, description: String },
}

impl<'a> GrabResult<'a> {
    pub fn from_owned(frame: &'a OwnedFrame) -> Self {
        match &frame.status {
            GrabStatus::Succeeded => Self::Succeeded(frame.view()),
            GrabStatus::Failed { code, description } => Self::Failed {
                code: *code,
                description: description.clone(),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

// ----------------------------------------------------------------------------
// NormalizedFrameBuffer: the bridge's single persistent buffer
// ----------------------------------------------------------------------------

/// Persistent output buffer. Allocated once at `initialize`, then only
/// overwritten in place. Not `Clone`: there is exactly one per bridge.
pub struct NormalizedFrameBuffer {
    encoding: OutputEncoding,
    width: u32,
    height: u32,
    data: Vec<u8>,
    /// Sequence of the frame currently held, `None` while still the placeholder.
    sequence: Option<u64>,
}

impl NormalizedFrameBuffer {
    /// Blank (zeroed) placeholder, published until the first good frame arrives.
    pub fn blank(encoding: OutputEncoding, width: u32, height: u32) -> Option<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(encoding.bytes_per_pixel())?;
        Some(Self {
            encoding,
            width,
            height,
            data: vec![0u8; len],
            sequence: None,
        })
    }

    pub fn encoding(&self) -> OutputEncoding {
        self.encoding
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// True until a frame has been written over the placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.sequence.is_none()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Mutable access for the normalizer. Length never changes.
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn mark_written(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    pub fn published(&self) -> PublishedFrame<'_> {
        PublishedFrame {
            data: &self.data,
            width: self.width,
            height: self.height,
            encoding: self.encoding,
            sequence: self.sequence,
        }
    }
}

impl fmt::Debug for NormalizedFrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedFrameBuffer")
            .field("encoding", &self.encoding)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Handle a consumer receives during one publish call.
///
/// Borrowed from the bridge's buffer; the next retrieval overwrites it, so
/// consumers copy out (or finish processing) before returning.
#[derive(Clone, Copy, Debug)]
pub struct PublishedFrame<'a> {
    data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub encoding: OutputEncoding,
    /// Source sequence of the content, `None` for the blank placeholder.
    pub sequence: Option<u64>,
}

impl<'a> PublishedFrame<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
