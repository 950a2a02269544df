//! Pixel sources feed the producer side of the queue.

use crate::capture::frame::{FrameId, FrameLayout};
use crate::error::BoxError;

/// The render loop's readback call.
///
/// `read_pixels` fills `dst` with exactly one frame in the session's
/// [`FrameLayout`]. It writes straight into the claimed queue slot, so
/// implementations should not allocate a frame-sized buffer of their own.
pub trait PixelSource {
    fn read_pixels(&mut self, id: FrameId, dst: &mut [u8]) -> Result<(), BoxError>;
}

impl<F> PixelSource for F
where
    F: FnMut(FrameId, &mut [u8]) -> Result<(), BoxError>,
{
    fn read_pixels(&mut self, id: FrameId, dst: &mut [u8]) -> Result<(), BoxError> {
        self(id, dst)
    }
}

/// Moving gradient used by the CLI and tests in place of a real renderer
#[derive(Debug, Clone)]
pub struct TestPattern {
    layout: FrameLayout,
}

impl TestPattern {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }
}

impl PixelSource for TestPattern {
    fn read_pixels(&mut self, id: FrameId, dst: &mut [u8]) -> Result<(), BoxError> {
        let channels = self.layout.format.channels();
        let width = self.layout.width as usize;
        let shift = id.0 as usize;

        for (y, row) in dst.chunks_exact_mut(self.layout.stride()).enumerate() {
            for (x, px) in row.chunks_exact_mut(channels).enumerate() {
                px[0] = ((x + shift) * 255 / width.max(1)) as u8;
                px[1] = (y * 255 / self.layout.height.max(1) as usize) as u8;
                px[2] = (shift % 256) as u8;
                if channels == 4 {
                    px[3] = 255;
                }
            }
        }
        Ok(())
    }
}
