//! End-to-end tests against the real TLS file listener: upload/download
//! round trip, the missing-file error, and the authenticated-chat-session
//! gate.

mod common;

use std::time::Duration;

use common::{generate_keypair, Harness};
use retro_protocol::{read_packet, recv_bytes, send_bytes, write_packet, FileId, PacketType, UserId};
use ring::signature::Ed25519KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn register_user(harness: &Harness) -> (UserId, Ed25519KeyPair) {
    let reg_key = harness.state.directory.new_unique_reg_key().unwrap();
    let mut stream = harness.connect_chat().await;

    write_packet(&mut stream, PacketType::Register, reg_key.as_bytes())
        .await
        .unwrap();
    let (_, payload) = read_packet(&mut stream, TIMEOUT).await.unwrap();
    let user_id = UserId::from_slice(&payload).unwrap();

    let (keypair, public_key) = generate_keypair();
    write_packet(&mut stream, PacketType::PubKey, &public_key)
        .await
        .unwrap();
    let (ty, _) = read_packet(&mut stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);

    (user_id, keypair)
}

async fn authenticate<S>(stream: &mut S, user_id: UserId, keypair: &Ed25519KeyPair)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = [3u8; 32];
    let signature = keypair.sign(&nonce);
    let mut payload = Vec::with_capacity(UserId::LEN + 32 + 64);
    payload.extend_from_slice(user_id.as_bytes());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(signature.as_ref());
    write_packet(stream, PacketType::Hello, &payload).await.unwrap();
    let (ty, _) = read_packet(stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);
}

fn upload_header(file_id: FileId, size: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(FileId::LEN + 4);
    header.extend_from_slice(file_id.as_bytes());
    header.extend_from_slice(&size.to_be_bytes());
    header
}

#[tokio::test]
async fn upload_then_download_round_trips_bytes() {
    let harness = Harness::start().await;
    let (user_id, keypair) = register_user(&harness).await;

    // The file listener only serves a peer whose IP already holds a
    // live chat session — keep it open for the whole test.
    let mut chat_stream = harness.connect_chat().await;
    authenticate(&mut chat_stream, user_id, &keypair).await;

    let file_id = FileId([0x11; 16]);
    let body = b"the quick brown fox jumps over the lazy dog";

    let mut upload_stream = harness.connect_file().await;
    write_packet(
        &mut upload_stream,
        PacketType::FileUpload,
        &upload_header(file_id, body.len() as u32),
    )
    .await
    .unwrap();
    let (ty, _) = read_packet(&mut upload_stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);

    send_bytes(&mut upload_stream, body).await.unwrap();
    let (ty, _) = read_packet(&mut upload_stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);
    drop(upload_stream);

    let mut download_stream = harness.connect_file().await;
    write_packet(&mut download_stream, PacketType::FileDownload, file_id.as_bytes())
        .await
        .unwrap();
    let (ty, payload) = read_packet(&mut download_stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);
    let size = u32::from_be_bytes(payload.try_into().unwrap()) as usize;
    assert_eq!(size, body.len());

    let received = recv_bytes(&mut download_stream, size, TIMEOUT).await.unwrap().unwrap();
    assert_eq!(received, body);

    harness.shutdown().await;
}

#[tokio::test]
async fn download_of_missing_file_errors() {
    let harness = Harness::start().await;
    let (user_id, keypair) = register_user(&harness).await;

    let mut chat_stream = harness.connect_chat().await;
    authenticate(&mut chat_stream, user_id, &keypair).await;

    let mut download_stream = harness.connect_file().await;
    write_packet(&mut download_stream, PacketType::FileDownload, FileId([0xee; 16]).as_bytes())
        .await
        .unwrap();
    let (ty, payload) = read_packet(&mut download_stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Error);
    assert_eq!(payload, b"Requested file doesn't exist");

    harness.shutdown().await;
}

#[tokio::test]
async fn file_connection_without_chat_session_is_closed() {
    let harness = Harness::start().await;

    let mut download_stream = harness.connect_file().await;
    write_packet(&mut download_stream, PacketType::FileDownload, FileId([0x01; 16]).as_bytes())
        .await
        .unwrap();

    let result = read_packet(&mut download_stream, TIMEOUT).await;
    assert!(result.is_err(), "expected the connection to be closed without a reply");

    harness.shutdown().await;
}
