//! Backend-agnostic texture description
//!
//! A [`Texture`] owns its CPU pixels and, once uploaded, a [`TextureHandle`]
//! to the backend's GPU copy. Every upload bumps `generation`, which is what
//! descriptor bookkeeping compares against to notice reloads.

use super::types::{TextureHandle, INVALID_ID};

/// Side length of the default checkerboard
pub const DEFAULT_TEXTURE_DIMENSION: u32 = 256;

/// Side length of one checkerboard tile in pixels
pub const DEFAULT_TEXTURE_TILE: u32 = 8;

/// Id reserved for the default texture
pub const DEFAULT_TEXTURE_ID: u32 = INVALID_ID - 1;

/// Name of the default texture
pub const DEFAULT_TEXTURE_NAME: &str = "default";

/// Image data plus its GPU-side handle
#[derive(Debug, Clone)]
pub struct Texture {
    /// Application-assigned id
    pub id: u32,
    /// Debug name
    pub name: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Channels per pixel in `data`
    pub channel_count: u8,
    /// Any pixel has alpha below 255
    pub has_transparency: bool,
    /// `INVALID_ID` until the first upload, then incremented on every upload
    pub generation: u32,
    /// Tightly packed pixels
    pub data: Vec<u8>,
    /// Backend copy, if uploaded
    pub handle: Option<TextureHandle>,
}

impl Texture {
    /// Describe a texture that has not been uploaded yet
    pub fn new(id: u32, name: impl Into<String>, width: u32, height: u32, channel_count: u8, data: Vec<u8>) -> Self {
        let has_transparency = has_transparency(&data, channel_count);
        Self {
            id,
            name: name.into(),
            width,
            height,
            channel_count,
            has_transparency,
            generation: INVALID_ID,
            data,
            handle: None,
        }
    }

    /// Decode an image file (any format the `image` crate reads) into RGBA8
    pub fn from_file(id: u32, path: impl AsRef<std::path::Path>) -> Result<Self, image::ImageError> {
        let path = path.as_ref();
        let rgba = image::open(path)?.into_rgba8();
        let (width, height) = rgba.dimensions();
        let name = path
            .file_stem()
            .map_or_else(|| path.display().to_string(), |stem| stem.to_string_lossy().into_owned());
        log::debug!("Decoded texture '{}' ({}x{})", name, width, height);
        Ok(Self::new(id, name, width, height, 4, rgba.into_raw()))
    }

    /// 256x256 RGBA checkerboard of blue and white 8x8 tiles
    pub fn default_checkerboard() -> Self {
        Self::new(
            DEFAULT_TEXTURE_ID,
            DEFAULT_TEXTURE_NAME,
            DEFAULT_TEXTURE_DIMENSION,
            DEFAULT_TEXTURE_DIMENSION,
            4,
            checkerboard_pixels(DEFAULT_TEXTURE_DIMENSION, DEFAULT_TEXTURE_TILE),
        )
    }

    /// GPU data exists for the current pixels
    pub fn is_uploaded(&self) -> bool {
        self.handle.is_some() && self.generation != INVALID_ID
    }

    /// Advance the generation after an upload
    pub fn mark_uploaded(&mut self, handle: TextureHandle) {
        self.handle = Some(handle);
        self.generation = next_generation(self.generation);
    }

    /// Forget the GPU copy, returning its handle.
    ///
    /// The generation is kept so the next upload still moves past every stamp
    /// written for earlier copies.
    pub fn mark_released(&mut self) -> Option<TextureHandle> {
        self.handle.take()
    }

    /// Replace the pixels; the texture must be uploaded again to take effect
    pub fn replace_data(&mut self, width: u32, height: u32, channel_count: u8, data: Vec<u8>) {
        self.has_transparency = has_transparency(&data, channel_count);
        self.width = width;
        self.height = height;
        self.channel_count = channel_count;
        self.data = data;
    }
}

/// `INVALID_ID -> 0 -> 1 -> ...`, skipping the sentinel on wrap
pub fn next_generation(generation: u32) -> u32 {
    match generation {
        INVALID_ID => 0,
        g if g + 1 == INVALID_ID => 0,
        g => g + 1,
    }
}

/// Whether any pixel's alpha channel is below fully opaque
pub fn has_transparency(data: &[u8], channel_count: u8) -> bool {
    match channel_count {
        2 | 4 => {
            let stride = usize::from(channel_count);
            data.iter().skip(stride - 1).step_by(stride).any(|&alpha| alpha < u8::MAX)
        }
        _ => false,
    }
}

/// Blue/white RGBA checkerboard with `tile` pixel squares
pub fn checkerboard_pixels(dimension: u32, tile: u32) -> Vec<u8> {
    let tile = tile.max(1);
    let mut pixels = Vec::with_capacity(dimension as usize * dimension as usize * 4);
    for row in 0..dimension {
        for col in 0..dimension {
            let white = (row / tile + col / tile) % 2 == 0;
            if white {
                pixels.extend_from_slice(&[255, 255, 255, 255]);
            } else {
                pixels.extend_from_slice(&[0, 0, 255, 255]);
            }
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(pixels: &[u8], dimension: u32, x: u32, y: u32) -> &[u8] {
        let start = ((y * dimension + x) * 4) as usize;
        &pixels[start..start + 4]
    }

    #[test]
    fn test_default_checkerboard_layout() {
        let texture = Texture::default_checkerboard();
        assert_eq!(texture.width, 256);
        assert_eq!(texture.height, 256);
        assert_eq!(texture.channel_count, 4);
        assert_eq!(texture.data.len(), 256 * 256 * 4);
        assert!(!texture.has_transparency);
        assert_eq!(texture.generation, INVALID_ID);

        assert_eq!(pixel(&texture.data, 256, 0, 0), &[255, 255, 255, 255]);
        assert_eq!(pixel(&texture.data, 256, 7, 7), &[255, 255, 255, 255]);
        assert_eq!(pixel(&texture.data, 256, 8, 0), &[0, 0, 255, 255]);
        assert_eq!(pixel(&texture.data, 256, 0, 8), &[0, 0, 255, 255]);
        assert_eq!(pixel(&texture.data, 256, 8, 8), &[255, 255, 255, 255]);
    }

    #[test]
    fn test_generation_advances_on_upload() {
        let mut texture = Texture::new(1, "test", 1, 1, 4, vec![0, 0, 0, 255]);
        assert!(!texture.is_uploaded());

        texture.mark_uploaded(TextureHandle(5));
        assert_eq!(texture.generation, 0);
        assert!(texture.is_uploaded());

        texture.mark_uploaded(TextureHandle(6));
        assert_eq!(texture.generation, 1);
        assert_eq!(texture.handle, Some(TextureHandle(6)));
    }

    #[test]
    fn test_release_keeps_generation_moving_forward() {
        let mut texture = Texture::new(1, "test", 1, 1, 4, vec![0, 0, 0, 255]);
        texture.mark_uploaded(TextureHandle(5));
        assert_eq!(texture.mark_released(), Some(TextureHandle(5)));
        assert!(!texture.is_uploaded());
        assert_eq!(texture.generation, 0);

        texture.mark_uploaded(TextureHandle(9));
        assert_eq!(texture.generation, 1);
        assert_eq!(texture.mark_released(), Some(TextureHandle(9)));
        assert_eq!(texture.mark_released(), None);
    }

    #[test]
    fn test_generation_never_lands_on_sentinel() {
        assert_eq!(next_generation(INVALID_ID), 0);
        assert_eq!(next_generation(INVALID_ID - 1), 0);
        assert_eq!(next_generation(41), 42);
    }

    #[test]
    fn test_transparency_detection() {
        assert!(!has_transparency(&[1, 2, 3, 255, 4, 5, 6, 255], 4));
        assert!(has_transparency(&[1, 2, 3, 255, 4, 5, 6, 128], 4));
        assert!(has_transparency(&[9, 0], 2));
        assert!(!has_transparency(&[9, 0, 1], 3));
    }

    #[test]
    fn test_replace_data_updates_transparency() {
        let mut texture = Texture::new(1, "test", 1, 1, 4, vec![0, 0, 0, 255]);
        texture.replace_data(1, 1, 4, vec![0, 0, 0, 10]);
        assert!(texture.has_transparency);
    }
}
