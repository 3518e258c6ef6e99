//! Color conversion engine: raw sensor formats → I420 → packed ARGB.
//!
//! Every conversion validates geometry and buffer sizes before touching the
//! output, so a failed call leaves the destination exactly as it was.

mod argb;
mod i420;

pub use argb::i420_to_argb;
pub use i420::to_i420;

use crate::capture::PixelFormat;
use crate::error::ConversionError;

/// Byte offsets and strides of the three I420 planes inside one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I420Layout {
    pub width: usize,
    pub height: usize,
}

impl I420Layout {
    pub fn new(width: u32, height: u32) -> Result<Self, ConversionError> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(ConversionError::OddDimensions { width, height });
        }
        Ok(Self {
            width: width as usize,
            height: height as usize,
        })
    }

    pub fn y_len(&self) -> usize {
        self.width * self.height
    }

    pub fn chroma_len(&self) -> usize {
        self.y_len() / 4
    }

    pub fn u_offset(&self) -> usize {
        self.y_len()
    }

    pub fn v_offset(&self) -> usize {
        self.y_len() + self.chroma_len()
    }

    pub fn y_stride(&self) -> usize {
        self.width
    }

    pub fn chroma_stride(&self) -> usize {
        self.width / 2
    }

    pub fn total(&self) -> usize {
        self.y_len() * 3 / 2
    }

    /// Split a full I420 buffer into its Y, U and V planes.
    pub fn planes<'a>(&self, buf: &'a [u8]) -> (&'a [u8], &'a [u8], &'a [u8]) {
        let (y, chroma) = buf.split_at(self.y_len());
        let (u, v) = chroma.split_at(self.chroma_len());
        (y, u, v)
    }

    pub fn planes_mut<'a>(&self, buf: &'a mut [u8]) -> (&'a mut [u8], &'a mut [u8], &'a mut [u8]) {
        let (y, chroma) = buf.split_at_mut(self.y_len());
        let (u, v) = chroma.split_at_mut(self.chroma_len());
        (y, u, v)
    }
}

/// Size of an I420 image: `width * height * 3 / 2`
pub fn i420_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

/// Size of a packed ARGB image: `width * height * 4`
pub fn argb_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Expected raw frame size for `format` at the given geometry
pub fn raw_size(format: PixelFormat, width: u32, height: u32) -> usize {
    format.frame_size(width, height)
}

pub(crate) fn check_len(
    what: &'static str,
    buf: &[u8],
    expected: usize,
) -> Result<(), ConversionError> {
    if buf.len() != expected {
        return Err(ConversionError::SizeMismatch {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}
