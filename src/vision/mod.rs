//! Image payload handling
//!
//! Requests carry images as base64 of an encoded bitmap (PNG, JPEG, ...).
//! Decoding is delegated to the `image` crate; this module glues the wire
//! payload to it and hosts the perspective crop used before recognition.

pub mod crop;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, GenericImageView};

use crate::error::BrokerError;
use crate::protocol::ContextResolution;

/// Decode a base64 image payload into a bitmap.
pub fn decode_payload(payload: &str) -> Result<DynamicImage, BrokerError> {
    let bytes = BASE64.decode(payload.trim())?;
    let image = image::load_from_memory(&bytes)?;
    Ok(image)
}

/// Dimensions of a bitmap as the wire reports them.
pub fn resolution_of(image: &DynamicImage) -> ContextResolution {
    ContextResolution {
        width: image.width(),
        height: image.height(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::io::Cursor;

    fn png_payload(width: u32, height: u32) -> String {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        BASE64.encode(&buf)
    }

    #[test]
    fn decodes_png_payload() {
        let payload = png_payload(3, 5);
        let image = decode_payload(&payload).unwrap();
        assert_eq!(image.width(), 3);
        assert_eq!(image.height(), 5);
        let res = resolution_of(&image);
        assert_eq!((res.width, res.height), (3, 5));
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(decode_payload("not base64 at all!!!").is_err());
        // Valid base64 that is not an image
        assert!(decode_payload(&BASE64.encode(b"hello world")).is_err());
    }
}
