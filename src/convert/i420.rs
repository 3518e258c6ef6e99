use super::{check_len, I420Layout};
use crate::capture::PixelFormat;
use crate::error::ConversionError;

/// Chroma value that carries no color
pub const NEUTRAL_CHROMA: u8 = 128;

/// Convert a raw frame into the planar I420 buffer `out`.
///
/// `out` must be exactly `width * height * 3 / 2` bytes and `raw` exactly
/// the packed size of `format` at `width x height`.
pub fn to_i420(
    raw: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<(), ConversionError> {
    let layout = I420Layout::new(width, height)?;
    check_len("raw", raw, format.frame_size(width, height))?;
    check_len("I420", out, layout.total())?;

    match format {
        PixelFormat::Mono8 => mono8_to_i420(raw, &layout, out),
        PixelFormat::Yuyv422 => yuyv_to_i420(raw, &layout, out),
    }
    Ok(())
}

fn mono8_to_i420(raw: &[u8], layout: &I420Layout, out: &mut [u8]) {
    let (y, u, v) = layout.planes_mut(out);
    y.copy_from_slice(raw);
    u.fill(NEUTRAL_CHROMA);
    v.fill(NEUTRAL_CHROMA);
}

/// YUY2 → I420: luma copied 1:1, chroma of each row pair averaged into one
/// sample per 2x2 block.
fn yuyv_to_i420(raw: &[u8], layout: &I420Layout, out: &mut [u8]) {
    let src_stride = layout.width * 2;
    let chroma_stride = layout.chroma_stride();
    let (y_plane, u_plane, v_plane) = layout.planes_mut(out);

    let rows = raw.chunks_exact(src_stride * 2);
    let y_rows = y_plane.chunks_exact_mut(layout.y_stride() * 2);
    let u_rows = u_plane.chunks_exact_mut(chroma_stride);
    let v_rows = v_plane.chunks_exact_mut(chroma_stride);

    for (((pair, y_pair), u_row), v_row) in rows.zip(y_rows).zip(u_rows).zip(v_rows) {
        let (top, bottom) = pair.split_at(src_stride);
        let (y_top, y_bottom) = y_pair.split_at_mut(layout.y_stride());

        for (dst, src) in y_top.iter_mut().zip(top.iter().step_by(2)) {
            *dst = *src;
        }
        for (dst, src) in y_bottom.iter_mut().zip(bottom.iter().step_by(2)) {
            *dst = *src;
        }

        for (i, (t, b)) in top
            .chunks_exact(4)
            .zip(bottom.chunks_exact(4))
            .enumerate()
        {
            u_row[i] = avg(t[1], b[1]);
            v_row[i] = avg(t[3], b[3]);
        }
    }
}

#[inline]
fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) >> 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::i420_size;

    #[test]
    fn mono_fills_neutral_chroma() {
        let raw = vec![200u8; 16 * 8];
        let mut out = vec![0u8; i420_size(16, 8)];
        to_i420(&raw, PixelFormat::Mono8, 16, 8, &mut out).unwrap();

        let layout = I420Layout::new(16, 8).unwrap();
        let (y, u, v) = layout.planes(&out);
        assert!(y.iter().all(|&b| b == 200));
        assert!(u.iter().all(|&b| b == 128));
        assert!(v.iter().all(|&b| b == 128));
    }

    #[test]
    fn yuyv_merges_row_pairs() {
        // 4x2: Y0 U Y1 V per macropixel
        let raw = [
            1, 100, 2, 200, 3, 50, 4, 60, //
            5, 102, 6, 203, 7, 51, 8, 61,
        ];
        let mut out = vec![0u8; i420_size(4, 2)];
        to_i420(&raw, PixelFormat::Yuyv422, 4, 2, &mut out).unwrap();
        assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        // (100+102+1)/2, (50+51+1)/2
        assert_eq!(&out[8..10], &[101, 51]);
        // (200+203+1)/2, (60+61+1)/2
        assert_eq!(&out[10..12], &[202, 61]);
    }

    #[test]
    fn size_mismatch_leaves_output_untouched() {
        let mut out = vec![7u8; i420_size(4, 2)];
        let err = to_i420(&[0u8; 7], PixelFormat::Mono8, 4, 2, &mut out).unwrap_err();
        assert_eq!(
            err,
            ConversionError::SizeMismatch {
                what: "raw",
                expected: 8,
                actual: 7
            }
        );
        assert!(out.iter().all(|&b| b == 7));

        let err = to_i420(&[0u8; 16], PixelFormat::Mono8, 4, 2, &mut out).unwrap_err();
        assert!(matches!(err, ConversionError::SizeMismatch { what: "raw", .. }));
    }

    #[test]
    fn wrong_output_size_rejected() {
        let mut out = vec![0u8; 11];
        let err = to_i420(&[0u8; 8], PixelFormat::Mono8, 4, 2, &mut out).unwrap_err();
        assert!(matches!(err, ConversionError::SizeMismatch { what: "I420", .. }));
    }

    #[test]
    fn repeated_conversion_is_identical() {
        let raw: Vec<u8> = (0..32u32 * 4 * 2).map(|i| (i * 37 % 251) as u8).collect();
        let mut first = vec![0u8; i420_size(32, 4)];
        to_i420(&raw, PixelFormat::Yuyv422, 32, 4, &mut first).unwrap();
        let mut second = first.clone();
        to_i420(&raw, PixelFormat::Yuyv422, 32, 4, &mut second).unwrap();
        assert_eq!(first, second);
    }
}
