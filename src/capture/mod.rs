pub mod frame;
pub mod source;

pub use frame::{Frame, FrameId, FrameLayout, PixelFormat, RowOrder};
pub use source::{PixelSource, TestPattern};
