//! Raw image handling: decoding, grayscale conversion, histogram equalization
//! and integral images for cascade evaluation.

use image::{GrayImage, RgbImage};

/// Decode encoded image bytes (PNG, JPEG, ...) into an 8-bit RGB image.
///
/// Channel order after decoding is always RGB, whatever the container stored.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Convert RGB to grayscale with the ITU-R BT.601 weights
/// (Y = 0.299 R + 0.587 G + 0.114 B).
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    let (w, h) = rgb.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (src, dst) in rgb.pixels().zip(gray.pixels_mut()) {
        let [r, g, b] = src.0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        dst.0[0] = y.round().clamp(0.0, 255.0) as u8;
    }
    gray
}

/// Global histogram equalization in-place.
///
/// Maps the cumulative histogram onto 0–255 so that the darkest occupied
/// bin becomes 0. A single-valued image is left unchanged.
pub fn equalize_hist(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0u32; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let first = hist.iter().position(|&c| c > 0).unwrap_or(0);
    if hist[first] as usize == total {
        return;
    }

    let scale = 255.0 / (total as f32 - hist[first] as f32);
    let mut lut = [0u8; 256];
    let mut sum = 0u32;
    for i in (first + 1)..256 {
        sum += hist[i];
        lut[i] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Summed-area tables of pixel values and squared pixel values.
///
/// Both tables are `(width + 1) * (height + 1)` with a zero first row and
/// column, so any rectangle sum costs four lookups.
pub struct IntegralImage {
    width: u32,
    height: u32,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let stride = width as usize + 1;
        let mut sum = vec![0u64; stride * (height as usize + 1)];
        let mut sq_sum = vec![0u64; stride * (height as usize + 1)];

        for y in 0..height as usize {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..width as usize {
                let p = gray.as_raw()[y * width as usize + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { width, height, sum, sq_sum }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sum of pixel values in `[x, x + w) × [y, y + h)`.
    pub fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.width, x, y, w, h)
    }

    /// Sum of squared pixel values in `[x, x + w) × [y, y + h)`.
    pub fn rect_sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sq_sum, self.width, x, y, w, h)
    }

    fn lookup(table: &[u64], width: u32, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let stride = width as usize + 1;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_grayscale_weights() {
        let mut rgb = RgbImage::new(3, 1);
        rgb.put_pixel(0, 0, Rgb([255, 0, 0]));
        rgb.put_pixel(1, 0, Rgb([0, 255, 0]));
        rgb.put_pixel(2, 0, Rgb([0, 0, 255]));
        let gray = to_grayscale(&rgb);
        assert_eq!(gray.as_raw(), &vec![76, 150, 29]);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let mut gray = GrayImage::from_fn(16, 16, |x, _| Luma([100 + (x % 4) as u8]));
        equalize_hist(&mut gray);
        let min = *gray.as_raw().iter().min().unwrap();
        let max = *gray.as_raw().iter().max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn test_equalize_uniform_unchanged() {
        let mut gray = GrayImage::from_pixel(8, 8, Luma([42]));
        equalize_hist(&mut gray);
        assert!(gray.as_raw().iter().all(|&p| p == 42));
    }

    #[test]
    fn test_integral_rect_sums() {
        let gray = GrayImage::from_fn(5, 4, |x, y| Luma([(x + y * 5) as u8]));
        let ii = IntegralImage::new(&gray);

        let mut expected = 0u64;
        let mut expected_sq = 0u64;
        for y in 1..3 {
            for x in 2..5 {
                let v = (x + y * 5) as u64;
                expected += v;
                expected_sq += v * v;
            }
        }
        assert_eq!(ii.rect_sum(2, 1, 3, 2), expected);
        assert_eq!(ii.rect_sq_sum(2, 1, 3, 2), expected_sq);
        assert_eq!(ii.rect_sum(0, 0, 5, 4), (0..20).sum::<u64>());
        assert_eq!(ii.rect_sum(3, 3, 0, 0), 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_rgb(b"definitely not an image").is_err());
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let img = RgbImage::from_pixel(7, 3, Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        let decoded = decode_rgb(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (7, 3));
        assert_eq!(decoded.get_pixel(3, 1), &Rgb([10, 20, 30]));
    }
}
