use image::{GenericImageView, GrayImage, Luma};

/// Bilinearly interpolated luma at `(x, y)`. Samples outside the image
/// return 0.
pub fn bilinear_sample_luma<T, I>(img: &I, x: f32, y: f32) -> f32
where
    I: GenericImageView<Pixel = Luma<T>>,
    T: Copy + Into<f32>,
{
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return 0.0;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00: f32 = img.get_pixel(x0, y0).0[0].into();
    let p10: f32 = img.get_pixel(x1, y0).0[0].into();
    let p01: f32 = img.get_pixel(x0, y1).0[0].into();
    let p11: f32 = img.get_pixel(x1, y1).0[0].into();

    let top = p00 + fx * (p10 - p00);
    let bottom = p01 + fx * (p11 - p01);
    top + fy * (bottom - top)
}

/// Wraps a row-major 8-bit luma buffer. Returns `None` when the buffer length
/// does not match the dimensions.
pub fn gray_from_raw(pixels: Vec<u8>, width: u32, height: u32) -> Option<GrayImage> {
    GrayImage::from_raw(width, height, pixels)
}

/// Converts a tightly packed RGBA buffer to luma (Rec. 601 weights).
pub fn gray_from_rgba(rgba: &[u8], width: u32, height: u32) -> Option<GrayImage> {
    let pixels = width as usize * height as usize;
    if rgba.len() != pixels * 4 {
        return None;
    }
    let luma = rgba
        .chunks_exact(4)
        .map(|px| {
            let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect();
    GrayImage::from_raw(width, height, luma)
}
