//! Frame encoder: rasterizes the current surface frame into a JPEG data URL.

use crate::frame::Frame;
use crate::surface::VideoSurface;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::path::Path;
use thiserror::Error;

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Error, Debug)]
pub enum EncodeError {
    /// The surface has no frame yet, the frame has zero dimensions, or the
    /// camera behind the surface has closed.
    #[error("video surface not ready")]
    NotReady,
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// An encoded still image plus the native size its pixel coordinates refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub data_url: String,
    pub width: u32,
    pub height: u32,
}

impl ImagePayload {
    /// Raw JPEG bytes, decoded back from the data URL.
    pub fn jpeg_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_data_url(&self.data_url)
    }
}

/// Stateless JPEG encoder. Every call reads the surface afresh.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUALITY)
    }
}

impl FrameEncoder {
    pub const DEFAULT_QUALITY: u8 = 80;

    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode whatever frame the surface holds right now.
    ///
    /// A closed surface is `NotReady` even though its last frame lingers.
    pub fn encode(&self, surface: &VideoSurface) -> Result<ImagePayload, EncodeError> {
        if !surface.is_live() {
            return Err(EncodeError::NotReady);
        }
        let frame = surface.current_frame().ok_or(EncodeError::NotReady)?;
        self.encode_frame(&frame)
    }

    pub fn encode_frame(&self, frame: &Frame) -> Result<ImagePayload, EncodeError> {
        if frame.is_empty() {
            return Err(EncodeError::NotReady);
        }
        self.encode_rgb(&frame.data, frame.width, frame.height)
    }

    /// Load an image file from disk and re-encode it (registration uploads).
    pub fn encode_file(&self, path: &Path) -> Result<ImagePayload, EncodeError> {
        let img = image::open(path)?.to_rgb8();
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(EncodeError::NotReady);
        }
        self.encode_rgb(img.as_raw(), width, height)
    }

    fn encode_rgb(&self, rgb: &[u8], width: u32, height: u32) -> Result<ImagePayload, EncodeError> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            rgb,
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;

        tracing::trace!(width, height, bytes = jpeg.len(), "frame encoded");

        Ok(ImagePayload {
            data_url: to_data_url(&jpeg),
            width,
            height,
        })
    }
}

/// Wrap JPEG bytes as a `data:image/jpeg;base64,` URL.
pub fn to_data_url(jpeg: &[u8]) -> String {
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(DATA_URL_PREFIX);
    base64::engine::general_purpose::STANDARD.encode_string(jpeg, &mut url);
    url
}

/// Decode a base64 image, with or without a `data:...;base64,` prefix.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let encoded = url.split_once(',').map_or(url, |(_, rest)| rest);
    base64::engine::general_purpose::STANDARD.decode(encoded.trim())
}
