//! Host image codec.
//!
//! Decodes PNG/JPEG/BMP into tightly packed RGBA8 pixels and encodes them
//! back via the `image` crate.
//!
//! # Example
//!
//! ```ignore
//! use pixcl_compute::codec::{self, ExportFormat};
//!
//! let img = codec::decode_file("input.png")?;
//! let bytes = codec::encode(&img.pixels, img.width, img.height, ExportFormat::Jpeg)?;
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor};
use std::path::Path;

use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};

use crate::{ComputeError, ComputeResult};

/// Output formats supported by [`encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Png,
    Jpeg,
    Bmp,
}

impl ExportFormat {
    /// Format from a file extension (case-insensitive).
    pub fn from_extension(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }

    /// Format from a name such as `png` or `JPEG`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Bmp => "bmp",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Bmp => ImageFormat::Bmp,
        }
    }
}

/// Decoded RGBA8 image.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bits per channel.
    pub bit_depth: u32,
}

/// Decode an encoded image from memory.
pub fn decode(bytes: &[u8]) -> ComputeResult<DecodedImage> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()
        .map_err(|e| ComputeError::Codec(e.to_string()))?;
    Ok(to_rgba8(img))
}

/// Decode an image file.
pub fn decode_file<P: AsRef<Path>>(path: P) -> ComputeResult<DecodedImage> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let img = ImageReader::new(reader)
        .with_guessed_format()?
        .decode()
        .map_err(|e| ComputeError::Codec(e.to_string()))?;
    Ok(to_rgba8(img))
}

fn to_rgba8(img: DynamicImage) -> DecodedImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    DecodedImage {
        pixels: rgba.into_raw(),
        width,
        height,
        bit_depth: 8,
    }
}

fn to_dynamic(pixels: &[u8], width: u32, height: u32) -> ComputeResult<DynamicImage> {
    let rgba = RgbaImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
        ComputeError::Codec(format!(
            "{} bytes do not hold a {}x{} RGBA8 image",
            pixels.len(),
            width,
            height
        ))
    })?;
    Ok(DynamicImage::ImageRgba8(rgba))
}

/// Encode RGBA8 pixels. JPEG drops the alpha channel.
pub fn encode(pixels: &[u8], width: u32, height: u32, format: ExportFormat) -> ComputeResult<Vec<u8>> {
    let img = to_dynamic(pixels, width, height)?;
    let img = match format {
        ExportFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format.image_format())
        .map_err(|e| ComputeError::Codec(e.to_string()))?;
    Ok(out.into_inner())
}

/// Encode RGBA8 pixels into a file.
pub fn encode_file<P: AsRef<Path>>(
    path: P,
    pixels: &[u8],
    width: u32,
    height: u32,
    format: ExportFormat,
) -> ComputeResult<()> {
    let bytes = encode(pixels, width, height, format)?;
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    std::io::Write::write_all(&mut writer, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> Vec<u8> {
        (0..4 * 4).flat_map(|i| if i % 2 == 0 { [255, 0, 0, 255] } else { [0, 0, 255, 128] }).collect()
    }

    #[test]
    fn test_png_preserves_pixels() {
        let pixels = checker();
        let bytes = encode(&pixels, 4, 4, ExportFormat::Png).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!((decoded.width, decoded.height, decoded.bit_depth), (4, 4, 8));
        assert_eq!(decoded.pixels, pixels);
    }

    #[test]
    fn test_jpeg_decodes_opaque() {
        let bytes = encode(&checker(), 4, 4, ExportFormat::Jpeg).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.pixels.len(), 64);
        assert!(decoded.pixels.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        assert!(matches!(
            encode(&[0u8; 10], 4, 4, ExportFormat::Bmp),
            Err(ComputeError::Codec(_))
        ));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(ExportFormat::from_extension("a/b.JPG"), Some(ExportFormat::Jpeg));
        assert_eq!(ExportFormat::from_name("bmp"), Some(ExportFormat::Bmp));
        assert_eq!(ExportFormat::from_extension("x.tiff"), None);
    }
}
