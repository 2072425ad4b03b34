pub mod codec;
pub mod frames;

pub use codec::{CodecError, Compression, MessageType, Serialization, WireFrame};
pub use frames::{AudioPayload, ClientFrame, FrameError, OutboundFrame, OutboundKind};
