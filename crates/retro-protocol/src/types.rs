//! Opaque on-wire identifiers and the packet-type enum.

use std::fmt;

/// 8-byte opaque user identity, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub [u8; 8]);

/// 32-byte single-use registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegKey(pub [u8; 32]);

/// 16-byte call rendezvous identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub [u8; 16]);

/// 16-byte opaque file blob identifier; a bearer capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub [u8; 16]);

macro_rules! hex_id {
    ($ty:ident, $len:expr) => {
        impl $ty {
            pub const LEN: usize = $len;

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

hex_id!(UserId, 8);
hex_id!(RegKey, 32);
hex_id!(CallId, 16);
hex_id!(FileId, 16);

/// Packet types carried by the framed chat/file transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Hello = 0x01,
    Register = 0x02,
    PubKey = 0x03,
    Success = 0x04,
    Error = 0x05,
    Goodbye = 0x06,
    ChatMsg = 0x07,
    FileMsg = 0x08,
    Friends = 0x09,
    FriendOnline = 0x0a,
    FriendOffline = 0x0b,
    FriendUnknown = 0x0c,
    GetPubKey = 0x0d,
    StartCall = 0x0e,
    AcceptCall = 0x0f,
    StopCall = 0x10,
    RejectCall = 0x11,
    FileUpload = 0x12,
    FileDownload = 0x13,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::error::ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use PacketType::*;
        Ok(match byte {
            0x01 => Hello,
            0x02 => Register,
            0x03 => PubKey,
            0x04 => Success,
            0x05 => Error,
            0x06 => Goodbye,
            0x07 => ChatMsg,
            0x08 => FileMsg,
            0x09 => Friends,
            0x0a => FriendOnline,
            0x0b => FriendOffline,
            0x0c => FriendUnknown,
            0x0d => GetPubKey,
            0x0e => StartCall,
            0x0f => AcceptCall,
            0x10 => StopCall,
            0x11 => RejectCall,
            0x12 => FileUpload,
            0x13 => FileDownload,
            other => return Err(crate::error::ProtocolError::UnknownPacketType(other)),
        })
    }
}
