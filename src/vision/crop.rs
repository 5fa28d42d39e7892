//! Perspective crop of a detected quad
//!
//! Recognition models want an upright rectangle. Cropping maps the quad's
//! four corners onto the corners of its axis-aligned bounding rectangle,
//! which squares up slanted detections before a recognizer sees them.

use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use crate::geometry::Quad;

/// Crop `quad` out of `image`.
///
/// The output has the size of the quad's axis-aligned bounding rectangle
/// and the four corners map onto `(0,0)`, `(w,0)`, `(w,h)`, `(0,h)`.
/// Returns `None` for degenerate quads (empty bounding rectangle or corner
/// sets that admit no projective mapping). Samples falling outside the
/// source image come back black.
pub fn crop_quad(image: &DynamicImage, quad: &Quad) -> Option<DynamicImage> {
    let (_, _, w, h) = quad.bounding_rect();
    if w <= 0 || h <= 0 {
        return None;
    }
    let (wf, hf) = (w as f32, h as f32);

    let from = [
        (quad.top_left.x as f32, quad.top_left.y as f32),
        (quad.top_right.x as f32, quad.top_right.y as f32),
        (quad.bottom_right.x as f32, quad.bottom_right.y as f32),
        (quad.bottom_left.x as f32, quad.bottom_left.y as f32),
    ];
    let to = [(0.0, 0.0), (wf, 0.0), (wf, hf), (0.0, hf)];
    let projection = Projection::from_control_points(from, to)?;

    let src = image.to_rgba8();
    let mut out = RgbaImage::new(w as u32, h as u32);
    warp_into(
        &src,
        &projection,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 255]),
        &mut out,
    );
    Some(DynamicImage::ImageRgba8(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vertex;
    use image::GenericImageView;

    fn test_image() -> DynamicImage {
        // 10x10 black image with a white 4x4 square at (2,2)
        let mut img = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        for y in 2..6 {
            for x in 2..6 {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn axis_aligned_crop_extracts_region() {
        let image = test_image();
        let crop = crop_quad(&image, &Quad::from_rect(2, 2, 4, 4)).unwrap();
        assert_eq!((crop.width(), crop.height()), (4, 4));
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(crop.get_pixel(x, y)[0], 255, "pixel ({x},{y})");
            }
        }
    }

    #[test]
    fn slanted_quad_crops_to_bounding_rect_size() {
        let image = test_image();
        let quad = Quad {
            top_left: Vertex::new(5, 0),
            top_right: Vertex::new(10, 5),
            bottom_right: Vertex::new(5, 10),
            bottom_left: Vertex::new(0, 5),
        };
        let crop = crop_quad(&image, &quad).unwrap();
        assert_eq!((crop.width(), crop.height()), (10, 10));
    }

    #[test]
    fn degenerate_quad_yields_none() {
        let image = test_image();
        let point = Quad::from_rect(3, 3, 0, 0);
        assert!(crop_quad(&image, &point).is_none());
    }
}
