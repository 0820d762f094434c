use super::sampler::RasterBuffer;

pub trait QrDecoder: Send + Sync {
    /// `None` when the frame holds no readable code.
    fn decode(&self, frame: &RasterBuffer) -> Option<String>;
}

/// Decodes with `rqrr` over the frame's greyscale.
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl QrDecoder for RqrrDecoder {
    fn decode(&self, frame: &RasterBuffer) -> Option<String> {
        if frame.is_empty() {
            return None;
        }
        let mut image = rqrr::PreparedImage::prepare_from_greyscale(
            frame.width() as usize,
            frame.height() as usize,
            |x, y| frame.luma(x as u32, y as u32),
        );
        image
            .detect_grids()
            .into_iter()
            .find_map(|grid| match grid.decode() {
                Ok((_, content)) if !content.trim().is_empty() => Some(content),
                Ok(_) => None,
                Err(err) => {
                    log::trace!("Found a grid that did not decode: {:?}", err);
                    None
                }
            })
    }
}
