//! Length-prefixed typed-packet framing: `u8 type || u32 BE length ||
//! payload`, plus raw deadline-bounded byte I/O for the audio relay and
//! file-transfer streaming bodies.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, RecvError, MAX_FRAME_SIZE};
use crate::types::PacketType;

/// Encode one packet for transmission.
pub fn encode_packet(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(packet_type.as_u8());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Attempt to extract one complete frame from a growable buffer fed by a
/// stream reader. Returns `Ok(None)` if more data is needed, and leaves
/// `buf` untouched in that case.
pub fn try_decode_frame(
    buf: &mut BytesMut,
) -> Result<Option<(PacketType, Vec<u8>)>, ProtocolError> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let packet_type = buf[0];
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < 5 + length {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type)?;
    buf.advance(5);
    let payload = buf.split_to(length).to_vec();
    Ok(Some((packet_type, payload)))
}

/// Read exactly one framed packet, bounded by `deadline`. A timeout is a
/// recoverable [`RecvError::Timeout`], distinct from I/O failure or a
/// clean EOF.
pub async fn read_packet<S>(
    stream: &mut S,
    deadline: Duration,
) -> Result<(PacketType, Vec<u8>), RecvError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, read_packet_inner(stream))
        .await
        .map_err(|_| RecvError::Timeout)?
}

async fn read_packet_inner<S>(stream: &mut S) -> Result<(PacketType, Vec<u8>), RecvError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    read_exact_or_eof(stream, &mut header).await?;

    let packet_type = PacketType::try_from(header[0])?;
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length).into());
    }

    let mut payload = vec![0u8; length];
    if length > 0 {
        read_exact_or_eof(stream, &mut payload).await?;
    }
    Ok((packet_type, payload))
}

async fn read_exact_or_eof<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), RecvError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RecvError::Eof),
        Err(e) => Err(RecvError::Io(e)),
    }
}

/// Write one framed packet.
pub async fn write_packet<S>(
    stream: &mut S,
    packet_type: PacketType,
    payload: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_packet(packet_type, payload)).await
}

/// Read up to `max` raw bytes (no framing), bounded by `deadline`. Used
/// by the audio relay and file-transfer streaming body. Returns `Ok(None)`
/// on clean EOF, `Ok(Some(bytes))` (possibly fewer than `max`) otherwise.
pub async fn recv_bytes<S>(
    stream: &mut S,
    max: usize,
    deadline: Duration,
) -> Result<Option<Vec<u8>>, RecvError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; max];
    let n = tokio::time::timeout(deadline, stream.read(&mut buf))
        .await
        .map_err(|_| RecvError::Timeout)??;
    if n == 0 {
        Ok(None)
    } else {
        buf.truncate(n);
        Ok(Some(buf))
    }
}

/// Send raw bytes (no framing).
pub async fn send_bytes<S>(stream: &mut S, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(data).await
}
