//! Software region-of-interest cropping for sources that deliver a larger
//! window than the pipeline publishes

use super::PixelFormat;
use crate::error::ConversionError;

/// A `width x height` window whose top-left corner sits at `(x, y)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn is_origin(&self) -> bool {
        self.x == 0 && self.y == 0
    }

    /// Copy the window out of a tightly packed `full_width x full_height` image.
    pub fn crop(
        &self,
        src: &[u8],
        format: PixelFormat,
        full_width: u32,
        full_height: u32,
        dst: &mut Vec<u8>,
    ) -> Result<(), ConversionError> {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        let fits = matches!(
            (right, bottom),
            (Some(r), Some(b)) if r <= full_width && b <= full_height
        );
        if !fits {
            return Err(ConversionError::GeometryMismatch {
                width: right.unwrap_or(u32::MAX),
                height: bottom.unwrap_or(u32::MAX),
                actual_width: full_width,
                actual_height: full_height,
            });
        }

        let expected = format.frame_size(full_width, full_height);
        if src.len() != expected {
            return Err(ConversionError::SizeMismatch {
                what: "source",
                expected,
                actual: src.len(),
            });
        }

        let bpp = format.bytes_per_pixel();
        let src_stride = full_width as usize * bpp;
        let row_len = self.width as usize * bpp;
        let left = self.x as usize * bpp;

        dst.clear();
        dst.reserve(row_len * self.height as usize);
        for row in src
            .chunks_exact(src_stride)
            .skip(self.y as usize)
            .take(self.height as usize)
        {
            dst.extend_from_slice(&row[left..left + row_len]);
        }
        Ok(())
    }
}
