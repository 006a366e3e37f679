//! Image object with host/device residency.
//!
//! ```text
//!             decode / blank
//!   Empty ─────────────────────> Host(pixels)
//!     ^                           │      ^
//!     │ dispose            push   │      │ pull
//!     │                           v      │
//!     └──────────────────────  Device(handle)
//! ```
//!
//! Residency is a single enum, so an image can never hold pixels and a
//! device handle at the same time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::executor::ImageMeta;
use crate::registry::BufferHandle;

/// RGBA.
pub const CHANNELS: u32 = 4;
/// Bits per channel.
pub const BIT_DEPTH: u32 = 8;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique image identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

impl ImageId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an image's pixels currently live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residency {
    /// Disposed or consumed.
    Empty,
    /// Decoded pixels in host memory.
    Host(Vec<u8>),
    /// Pixels in a registry-owned device buffer.
    Device(BufferHandle),
}

/// An RGBA8 image tracked by the runtime.
#[derive(Debug, Clone)]
pub struct ImageObject {
    id: ImageId,
    name: String,
    path: Option<PathBuf>,
    width: u32,
    height: u32,
    channels: u32,
    bit_depth: u32,
    residency: Residency,
}

impl ImageObject {
    /// Host-resident image from tightly packed RGBA8 pixels.
    pub fn from_pixels(name: impl Into<String>, pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id: ImageId::next(),
            name: name.into(),
            path: None,
            width,
            height,
            channels: CHANNELS,
            bit_depth: BIT_DEPTH,
            residency: Residency::Host(pixels),
        }
    }

    /// Zero-filled canvas.
    pub fn blank(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * (CHANNELS * BIT_DEPTH / 8) as usize;
        Self::from_pixels(format!("blank_{}x{}", width, height), vec![0u8; len], width, height)
    }

    /// Decode an image file.
    #[cfg(feature = "io")]
    pub fn load<P: AsRef<Path>>(path: P) -> crate::ComputeResult<Self> {
        let path = path.as_ref();
        let decoded = crate::codec::decode_file(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut image = Self::from_pixels(name, decoded.pixels, decoded.width, decoded.height);
        image.bit_depth = decoded.bit_depth;
        image.path = Some(path.to_path_buf());
        debug!(image = %image.id, path = %path.display(), "image loaded");
        Ok(image)
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Source file, None for synthesized images.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    /// width × height × channels × (bit depth / 8).
    pub fn size_in_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.channels as u64 * (self.bit_depth / 8) as u64
    }

    /// Geometry handed to the executor.
    pub fn meta(&self) -> ImageMeta {
        ImageMeta {
            width: self.width as i64,
            height: self.height as i64,
            channels: self.channels as i64,
            bit_depth: self.bit_depth as i64,
        }
    }

    // -------------------------------------------------------------------------
    // Residency
    // -------------------------------------------------------------------------

    pub fn residency(&self) -> &Residency {
        &self.residency
    }

    pub fn is_on_host(&self) -> bool {
        matches!(self.residency, Residency::Host(_))
    }

    pub fn is_on_device(&self) -> bool {
        matches!(self.residency, Residency::Device(_))
    }

    pub fn is_empty(&self) -> bool {
        self.residency == Residency::Empty
    }

    pub fn device_handle(&self) -> Option<BufferHandle> {
        match self.residency {
            Residency::Device(handle) => Some(handle),
            _ => None,
        }
    }

    /// Borrow host pixels.
    pub fn pixels(&self) -> Option<&[u8]> {
        match &self.residency {
            Residency::Host(pixels) => Some(pixels),
            _ => None,
        }
    }

    /// Host pixels; consumed (image becomes empty) unless `keep`.
    pub fn get_bytes(&mut self, keep: bool) -> Vec<u8> {
        if keep {
            return self.pixels().map(<[u8]>::to_vec).unwrap_or_default();
        }
        match std::mem::replace(&mut self.residency, Residency::Empty) {
            Residency::Host(pixels) => pixels,
            other => {
                self.residency = other;
                Vec::new()
            }
        }
    }

    /// Replace contents with host pixels (clears any device handle).
    pub fn set_pixels(&mut self, pixels: Vec<u8>) {
        self.residency = Residency::Host(pixels);
    }

    /// Mark as device-resident (drops host pixels).
    pub fn set_device_handle(&mut self, handle: BufferHandle) {
        self.residency = Residency::Device(handle);
    }

    /// Drop pixels and handle. Returns the handle it held; the device
    /// record is not freed.
    pub fn dispose(&mut self) -> Option<BufferHandle> {
        let handle = self.device_handle();
        self.residency = Residency::Empty;
        handle
    }

    // -------------------------------------------------------------------------
    // Export
    // -------------------------------------------------------------------------

    /// Encode host pixels.
    #[cfg(feature = "io")]
    pub fn encode(&self, format: crate::codec::ExportFormat) -> crate::ComputeResult<Vec<u8>> {
        let pixels = self.pixels().ok_or_else(|| {
            crate::ComputeError::Codec(format!("image {} is not host-resident", self.id))
        })?;
        crate::codec::encode(pixels, self.width, self.height, format)
    }

    /// Write host pixels to `path`; format from the extension unless given.
    #[cfg(feature = "io")]
    pub fn export<P: AsRef<Path>>(
        &self,
        path: P,
        format: Option<crate::codec::ExportFormat>,
    ) -> crate::ComputeResult<()> {
        let path = path.as_ref();
        let format = format
            .or_else(|| crate::codec::ExportFormat::from_extension(path))
            .unwrap_or(crate::codec::ExportFormat::Png);
        let bytes = self.encode(format)?;
        std::fs::write(path, bytes)?;
        debug!(image = %self.id, path = %path.display(), "image exported");
        Ok(())
    }
}
