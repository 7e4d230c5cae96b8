//! Frame containers passed from capture workers to the compositor.
//!
//! - `RawImage`: sensor buffer exactly as a camera driver delivered it.
//! - `Image`: decoded RGB pixels. Not `Clone`; moves between threads by ownership.
//! - `FrameEnvelope`: one decoded frame stamped with its hardware timestamp and camera index.
//!
//! Pixels are never copied on the way from a worker to the compositor. The only
//! fresh pixel allocations are decode conversions, resizes to the grid cell size,
//! and the composite canvas itself.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Default grid cell width. Every frame is fitted to the cell before compositing.
pub const DEFAULT_CELL_WIDTH: u32 = 640;

/// Default grid cell height.
pub const DEFAULT_CELL_HEIGHT: u32 = 480;

// ----------------------------------------------------------------------------
// Raw driver output
// ----------------------------------------------------------------------------

/// Pixel layouts a driver may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Mono8,
    Rgb8,
    Bgr8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mono8" => Ok(PixelFormat::Mono8),
            "rgb8" => Ok(PixelFormat::Rgb8),
            "bgr8" => Ok(PixelFormat::Bgr8),
            other => Err(anyhow!("unknown pixel format '{}'", other)),
        }
    }
}

/// Undecoded sensor buffer.
pub struct RawImage {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Byte length implied by the dimensions and format, `None` on overflow.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.format.channels())
    }
}

// ----------------------------------------------------------------------------
// Image: decoded pixels
// ----------------------------------------------------------------------------

/// Decoded 8-bit RGB frame.
///
/// Deliberately not `Clone`: a frame has exactly one owner at a time.
pub struct Image {
    pixels: RgbImage,
}

impl Image {
    /// All-black frame, used to pad unfilled grid cells.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbImage::new(width, height),
        }
    }

    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// RGB value at `(x, y)`, `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        self.pixels.get_pixel_checked(x, y).map(|p| p.0)
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.as_raw().len()
    }

    /// Fit the frame to `width` x `height`. Returns `self` untouched when it already fits.
    pub fn fit_to(self, width: u32, height: u32) -> Self {
        if self.width() == width && self.height() == height {
            return self;
        }
        Self {
            pixels: imageops::resize(&self.pixels, width, height, FilterType::Triangle),
        }
    }
}

/// Decode a raw driver buffer into an RGB `Image`.
///
/// The buffer length must match the dimensions exactly. RGB input is adopted
/// without copying; BGR is swizzled in place.
pub fn decode(raw: RawImage) -> Result<Image> {
    if raw.width == 0 || raw.height == 0 {
        return Err(anyhow!(
            "raw frame has empty dimensions {}x{}",
            raw.width,
            raw.height
        ));
    }
    let expected = raw
        .expected_len()
        .ok_or_else(|| anyhow!("raw frame dimensions overflow"))?;
    if raw.data.len() != expected {
        return Err(anyhow!(
            "raw {:?} frame is {} bytes, expected {} for {}x{}",
            raw.format,
            raw.data.len(),
            expected,
            raw.width,
            raw.height
        ));
    }

    let RawImage {
        mut data,
        width,
        height,
        format,
    } = raw;
    let rgb = match format {
        PixelFormat::Rgb8 => data,
        PixelFormat::Bgr8 => {
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            data
        }
        PixelFormat::Mono8 => data.iter().flat_map(|&v| [v, v, v]).collect(),
    };
    let pixels = RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("decoded buffer does not fit {}x{}", width, height))?;
    Ok(Image { pixels })
}

// ----------------------------------------------------------------------------
// FrameEnvelope
// ----------------------------------------------------------------------------

/// One decoded frame plus where and when it was captured.
pub struct FrameEnvelope {
    image: Image,
    /// Monotonic hardware timestamp from the originating camera.
    pub timestamp_ns: u64,
    /// Position of the camera in the run, stable for the camera's lifetime.
    pub camera_index: usize,
    /// Host-side instant the envelope was built (for latency logging only).
    created_at: Instant,
}

impl FrameEnvelope {
    pub fn new(image: Image, timestamp_ns: u64, camera_index: usize) -> Self {
        Self {
            image,
            timestamp_ns,
            camera_index,
            created_at: Instant::now(),
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Time since the worker built this envelope.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn into_parts(self) -> (Image, u64, usize) {
        (self.image, self.timestamp_ns, self.camera_index)
    }
}

impl std::fmt::Debug for FrameEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEnvelope")
            .field("camera_index", &self.camera_index)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
