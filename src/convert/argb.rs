use super::{check_len, I420Layout};
use crate::error::ConversionError;

// Full-range BT.601 coefficients in 16.16 fixed point
const V_TO_R: i32 = 91_881; // 1.402
const U_TO_G: i32 = 22_554; // 0.344136
const V_TO_G: i32 = 46_802; // 0.714136
const U_TO_B: i32 = 116_130; // 1.772
const ROUND: i32 = 1 << 15;

/// Convert an I420 buffer into packed ARGB.
///
/// Each pixel is a little-endian `0xAARRGGBB` word, so memory order is
/// `B, G, R, A`. Alpha is always 255.
pub fn i420_to_argb(
    i420: &[u8],
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<(), ConversionError> {
    let layout = I420Layout::new(width, height)?;
    check_len("I420", i420, layout.total())?;
    check_len("ARGB", out, super::argb_size(width, height))?;

    let (y_plane, u_plane, v_plane) = layout.planes(i420);
    let chroma_stride = layout.chroma_stride();

    for (row, (y_row, out_row)) in y_plane
        .chunks_exact(layout.y_stride())
        .zip(out.chunks_exact_mut(layout.width * 4))
        .enumerate()
    {
        let chroma_start = (row / 2) * chroma_stride;
        let u_row = &u_plane[chroma_start..chroma_start + chroma_stride];
        let v_row = &v_plane[chroma_start..chroma_start + chroma_stride];

        for (col, (&y, px)) in y_row.iter().zip(out_row.chunks_exact_mut(4)).enumerate() {
            let [b, g, r] = yuv_to_rgb(y, u_row[col / 2], v_row[col / 2]);
            px.copy_from_slice(&[b, g, r, 0xff]);
        }
    }
    Ok(())
}

/// Returns `[B, G, R]`
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    let r = y + ((V_TO_R * v + ROUND) >> 16);
    let g = y - ((U_TO_G * u + V_TO_G * v + ROUND) >> 16);
    let b = y + ((U_TO_B * u + ROUND) >> 16);
    [clamp(b), clamp(g), clamp(r)]
}

#[inline]
fn clamp(c: i32) -> u8 {
    c.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::convert::{argb_size, i420_size, to_i420};

    #[test]
    fn grey_maps_to_grey() {
        let raw = vec![200u8; 8 * 4];
        let mut i420 = vec![0u8; i420_size(8, 4)];
        to_i420(&raw, PixelFormat::Mono8, 8, 4, &mut i420).unwrap();

        let mut argb = vec![0u8; argb_size(8, 4)];
        i420_to_argb(&i420, 8, 4, &mut argb).unwrap();
        assert!(argb.chunks_exact(4).all(|px| px == [200, 200, 200, 255]));
    }

    #[test]
    fn primaries_land_in_expected_channels() {
        // Saturated red in full-range BT.601: Y=76, U=85, V=255
        assert_eq!(yuv_to_rgb(76, 85, 255), [0, 0, 254]);
        // Saturated blue: Y=29, U=255, V=107
        let [b, g, r] = yuv_to_rgb(29, 255, 107);
        assert!(b >= 254 && g <= 1 && r == 0);
    }

    #[test]
    fn chroma_is_shared_by_2x2_blocks() {
        // 4x2 with a distinct chroma pair for each block
        let mut i420 = vec![128u8; i420_size(4, 2)];
        i420[8] = 200; // U for left block
        let mut argb = vec![0u8; argb_size(4, 2)];
        i420_to_argb(&i420, 4, 2, &mut argb).unwrap();

        let px = |n: usize| &argb[n * 4..n * 4 + 4];
        for left in [0, 1, 4, 5] {
            assert_eq!(px(left), px(0));
        }
        for right in [2, 3, 6, 7] {
            assert_eq!(px(right), [128, 128, 128, 255]);
        }
        assert_ne!(px(0), px(2));
    }

    #[test]
    fn rejects_short_buffers() {
        let mut argb = vec![0u8; argb_size(4, 2)];
        assert!(i420_to_argb(&[0u8; 11], 4, 2, &mut argb).is_err());
        let mut short = vec![0u8; 31];
        assert!(i420_to_argb(&[0u8; 12], 4, 2, &mut short).is_err());
    }
}
