//! Wire protocol shared by the chat, file and audio listeners.
//!
//! Every chat/file packet on the wire is `u8 type || u32 BE length || payload`.
//! The audio relay carries no framing of its own past the initial 16-byte
//! call id; see [`codec`] for both.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{encode_packet, read_packet, recv_bytes, send_bytes, try_decode_frame, write_packet};
pub use error::{ProtocolError, RecvError};
pub use types::{CallId, FileId, PacketType, RegKey, UserId};
