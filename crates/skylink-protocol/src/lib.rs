//! Wire frames for the skylink multiplexed WebSocket protocol.
//!
//! A single socket carries many logical conversations. Each frame is a
//! four-element JSON array, positional rather than keyed:
//!
//! - `protocol`: logical channel
//! - `messageType`: operation within that channel
//! - `sequence`: request correlation number (responses echo it; event
//!   frames carry a per-subscription running counter)
//! - payload (outbound, string map) or body (inbound, `dt`/`data` or
//!   `et`/`msg`)
//!
//! # Example
//!
//! ```rust
//! use skylink_protocol::{Payload, decode_frame, encode_request};
//!
//! let text = encode_request(1, 1, 1, &Payload::new().with("parameter", "X")).unwrap();
//! assert_eq!(text, r#"[1,1,1,{"parameter":"X"}]"#);
//!
//! let reply = decode_frame(r#"[1,2,1,{}]"#).unwrap();
//! assert_eq!(reply.sequence, 1);
//! ```

mod codec;
mod error;
mod types;

pub use codec::{decode_frame, decode_value, encode_frame, encode_outbound, encode_request};
pub use error::{ProtocolError, ProtocolResult};
pub use types::{FrameBody, FrameKind, InboundFrame, OutboundFrame, Payload};

/// Maximum encoded frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
