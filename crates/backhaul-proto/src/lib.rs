//! Tunnel Protocol Definitions
//!
//! Wire messages, the tunnel request descriptor and the length-prefixed frame
//! codec shared by the server and the client.

pub mod codec;
pub mod messages;
pub mod request;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;
pub use request::{extras, normalize_host, BasicAuthConfig, TunnelRequest, TunnelType};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Fixed part of a frame after the length prefix:
/// command (1) + tunnel id (8) + session id (8) + header length (4)
pub const FRAME_FIXED_SIZE: usize = 21;
