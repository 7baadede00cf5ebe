pub mod decoder;
pub mod frame;

pub use decoder::{FrameDecoder, ImageDecoder};
pub use frame::FrameRecord;
pub use frame::PayloadFormat;
