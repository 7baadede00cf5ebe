pub mod channel;

pub use channel::{ChannelStats, FrameChannel};
