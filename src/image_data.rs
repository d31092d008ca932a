use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, RgbImage};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Rebuilds an image from the raw buffer carried by a dataset item.
pub fn image_from_raw(raw: Vec<u8>, channels: usize, width: u32, height: u32) -> Option<DynamicImage> {
    match channels {
        1 => GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
        _ => None,
    }
}

/// Width an image of `width x height` gets when scaled to `img_h` rows,
/// capped at `img_w`.
pub fn resized_width(width: u32, height: u32, img_h: u32, img_w: u32) -> u32 {
    let ratio = width as f64 / height.max(1) as f64;
    let target = (img_h as f64 * ratio).ceil() as u32;

    target.clamp(1, img_w)
}

/// `[C, H, W]` floats in `[-1.0, 1.0]`.
fn to_chw(img: &DynamicImage, channels: usize) -> Vec<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let interleaved = match channels {
        1 => img.to_luma8().into_raw(),
        _ => img.to_rgb8().into_raw(),
    };
    let channels = if channels == 1 { 1 } else { 3 };

    let mut res = vec![0.0; channels * height * width];
    for (idx, &value) in interleaved.iter().enumerate() {
        let pixel = idx / channels;
        let c = idx % channels;
        // range: [-1.0, 1.0]
        res[c * height * width + pixel] = (value as f32 / 255.0 - 0.5) / 0.5;
    }

    res
}

/// Resize-and-normalize step applied to every image of a recognizer batch.
#[derive(Clone, Debug)]
pub struct AlignCollate {
    pub img_h: u32,
    pub img_w: u32,
    pub keep_ratio_with_pad: bool,
    pub channels: usize,
}

impl AlignCollate {
    pub fn new(img_h: u32, img_w: u32, keep_ratio_with_pad: bool, channels: usize) -> Self {
        Self {
            img_h,
            img_w,
            keep_ratio_with_pad,
            channels: if channels == 1 { 1 } else { 3 },
        }
    }

    /// Number of floats one transformed image occupies.
    pub fn item_len(&self) -> usize {
        self.channels * self.img_h as usize * self.img_w as usize
    }

    pub fn transform(&self, img: &DynamicImage) -> Vec<f32> {
        if self.keep_ratio_with_pad {
            let resized_w = resized_width(img.width(), img.height(), self.img_h, self.img_w);
            let resized = img.resize_exact(resized_w, self.img_h, FilterType::CatmullRom);
            normalize_pad(
                &to_chw(&resized, self.channels),
                self.channels,
                self.img_h as usize,
                resized_w as usize,
                self.img_w as usize,
            )
        } else {
            let resized = img.resize_exact(self.img_w, self.img_h, FilterType::CatmullRom);
            to_chw(&resized, self.channels)
        }
    }
}

/// Right-pads a `[C, H, W]` buffer to `max_width` columns by repeating the
/// last column.
pub fn normalize_pad(
    chw: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    max_width: usize,
) -> Vec<f32> {
    let mut res = vec![0.0; channels * height * max_width];
    for c in 0..channels {
        for y in 0..height {
            let src = &chw[(c * height + y) * width..(c * height + y + 1) * width];
            let dst = &mut res[(c * height + y) * max_width..(c * height + y + 1) * max_width];
            let copied = width.min(max_width);
            dst[..copied].copy_from_slice(&src[..copied]);
            if copied > 0 {
                let border = src[copied - 1];
                dst[copied..].fill(border);
            }
        }
    }

    res
}

/// Fits an image into a `canvas x canvas` square for the detector.
///
/// The longer side becomes `canvas`, the rest is zero padded on the
/// bottom/right, and the whole canvas, padding included, is normalized with
/// the ImageNet statistics.
/// Returns the `[3, canvas, canvas]` buffer and the applied scale.
pub fn resize_to_canvas(img: &RgbImage, canvas: u32) -> (Vec<f32>, f32) {
    let longer = img.width().max(img.height()).max(1);
    let scale = canvas as f32 / longer as f32;
    let new_w = ((img.width() as f32 * scale).round() as u32).clamp(1, canvas);
    let new_h = ((img.height() as f32 * scale).round() as u32).clamp(1, canvas);
    let resized = imageops::resize(img, new_w, new_h, FilterType::CatmullRom);

    let canvas = canvas as usize;
    let plane = canvas * canvas;
    let mut res = vec![0.0; 3 * plane];
    for c in 0..3 {
        res[c * plane..(c + 1) * plane].fill(-IMAGENET_MEAN[c] / IMAGENET_STD[c]);
    }
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel.0[c] as f32 / 255.0;
            res[(c * canvas + y as usize) * canvas + x as usize] =
                (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    (res, scale)
}

#[cfg(test)]
mod test {
    use image::{Luma, Rgb};

    use super::*;

    #[test]
    fn test_resized_width() {
        // 200x100 -> ratio 2.0 -> 64 columns
        assert_eq!(resized_width(200, 100, 32, 100), 64);
        // wide images are capped
        assert_eq!(resized_width(1000, 10, 32, 100), 100);
        // ceil, not round
        assert_eq!(resized_width(33, 32, 32, 100), 33);
        assert_eq!(resized_width(1, 1000, 32, 100), 1);
    }

    #[test]
    fn test_normalize_pad_repeats_last_column() {
        let chw = vec![0.1, 0.2, 0.3, 0.4];
        let res = normalize_pad(&chw, 1, 2, 2, 4);

        assert_eq!(res, vec![0.1, 0.2, 0.2, 0.2, 0.3, 0.4, 0.4, 0.4]);
    }

    #[test]
    fn test_keep_ratio_with_pad() {
        let mut img = GrayImage::from_pixel(64, 32, Luma([255]));
        for y in 0..32 {
            img.put_pixel(63, y, Luma([0]));
        }
        let collate = AlignCollate::new(32, 100, true, 1);
        let res = collate.transform(&DynamicImage::ImageLuma8(img));

        assert_eq!(res.len(), collate.item_len());
        assert!((res[0] - 1.0).abs() < 1e-6);
        // columns past the resized width copy the border column
        for y in 0..32 {
            let row = &res[y * 100..(y + 1) * 100];
            assert!(row[64..].iter().all(|&v| v == row[63]));
        }
        assert!(res.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_plain_resize() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 50, Rgb([0, 128, 255])));
        let collate = AlignCollate::new(32, 100, false, 3);
        let res = collate.transform(&img);

        assert_eq!(res.len(), 3 * 32 * 100);
        assert!((res[0] + 1.0).abs() < 1e-6);
        assert!((res[2 * 32 * 100] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_to_canvas() {
        let img = RgbImage::from_pixel(40, 20, Rgb([255, 255, 255]));
        let (res, scale) = resize_to_canvas(&img, 16);

        assert_eq!(scale, 0.4);
        assert_eq!(res.len(), 3 * 16 * 16);
        assert!(res[0] > 2.0);
        // bottom half is a normalized black pixel in every channel
        for c in 0..3 {
            let padding = res[c * 16 * 16 + 15 * 16];
            assert!((padding + IMAGENET_MEAN[c] / IMAGENET_STD[c]).abs() < 1e-6);
        }
        assert!((res[15 * 16] + 2.117904).abs() < 1e-4);
    }

    #[test]
    fn test_image_from_raw() {
        assert!(image_from_raw(vec![0; 12], 3, 2, 2).is_some());
        assert!(image_from_raw(vec![0; 3], 1, 2, 2).is_none());
        assert!(image_from_raw(vec![0; 8], 2, 2, 2).is_none());
    }
}
