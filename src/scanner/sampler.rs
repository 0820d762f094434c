use super::camera::{CameraErrorKind, VideoStream};

/// Single RGBA frame buffer, overwritten on every sample.
#[derive(Debug, Default, Clone)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl RasterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes to `width`x`height`, reusing the allocation, and hands out the
    /// pixel slice to overwrite.
    pub fn prepare(&mut self, width: u32, height: u32) -> &mut [u8] {
        self.width = width;
        self.height = height;
        self.rgba.resize(width as usize * height as usize * 4, 0);
        &mut self.rgba
    }

    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.rgba.clear();
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixels(&self) -> &[u8] {
        &self.rgba
    }

    /// ITU-R BT.601 luma of the pixel at `(x, y)`.
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let at = (y as usize * self.width as usize + x as usize) * 4;
        match self.rgba.get(at..at + 3) {
            Some(&[r, g, b]) => {
                ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
            }
            _ => 0,
        }
    }
}

/// Copies the stream's current frame into `buffer`.
///
/// Returns `Ok(false)` without touching the stream while its resolution is
/// still unknown, or when no frame of that resolution is available.
pub fn sample_frame<S: VideoStream + ?Sized>(
    stream: &mut S,
    buffer: &mut RasterBuffer,
) -> Result<bool, CameraErrorKind> {
    let (width, height) = stream.resolution();
    if width == 0 || height == 0 {
        return Ok(false);
    }
    let captured = stream.capture(buffer.prepare(width, height))?;
    if !captured {
        buffer.clear();
    }
    Ok(captured)
}
