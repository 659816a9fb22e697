//! End-to-end tests against the real audio listener: the
//! authenticated-chat-session gate, solo-leg pairing timeout, and a
//! two-leg byte relay.

mod common;

use std::time::Duration;

use common::{generate_keypair, Harness};
use retro_protocol::{read_packet, write_packet, PacketType, UserId};
use ring::signature::Ed25519KeyPair;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn register_and_authenticate(harness: &Harness) -> (UserId, Ed25519KeyPair) {
    let reg_key = harness.state.directory.new_unique_reg_key().unwrap();
    let mut reg_stream = harness.connect_chat().await;
    write_packet(&mut reg_stream, PacketType::Register, reg_key.as_bytes())
        .await
        .unwrap();
    let (_, payload) = read_packet(&mut reg_stream, TIMEOUT).await.unwrap();
    let user_id = UserId::from_slice(&payload).unwrap();

    let (keypair, public_key) = generate_keypair();
    write_packet(&mut reg_stream, PacketType::PubKey, &public_key)
        .await
        .unwrap();
    let (ty, _) = read_packet(&mut reg_stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);
    drop(reg_stream);

    (user_id, keypair)
}

/// Leaves the returned chat stream open for the caller — the audio
/// listener's only access control is the peer IP holding a live chat
/// session, so the connection must stay up for the whole test.
async fn keep_chat_session_alive(
    harness: &Harness,
    user_id: UserId,
    keypair: &Ed25519KeyPair,
) -> tokio_rustls::client::TlsStream<tokio::net::TcpStream> {
    let nonce = [5u8; 32];
    let signature = keypair.sign(&nonce);
    let mut payload = Vec::with_capacity(UserId::LEN + 32 + 64);
    payload.extend_from_slice(user_id.as_bytes());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(signature.as_ref());

    let mut stream = harness.connect_chat().await;
    write_packet(&mut stream, PacketType::Hello, &payload).await.unwrap();
    let (ty, _) = read_packet(&mut stream, TIMEOUT).await.unwrap();
    assert_eq!(ty, PacketType::Success);
    stream
}

#[tokio::test]
async fn audio_leg_without_chat_session_is_closed() {
    let harness = Harness::start().await;

    let mut audio = harness.connect_audio().await;
    audio.write_all(&[1u8; 16]).await.unwrap();

    let mut status = [0u8; 1];
    let result = tokio::time::timeout(TIMEOUT, audio.read_exact(&mut status)).await;
    assert!(
        matches!(result, Ok(Err(_))),
        "expected the connection to close without a pairing status byte"
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn lone_authenticated_leg_times_out() {
    let harness = Harness::start_with(|cfg| {
        cfg.recv_timeout = Duration::from_millis(300);
    })
    .await;
    let (user_id, keypair) = register_and_authenticate(&harness).await;
    let _chat_stream = keep_chat_session_alive(&harness, user_id, &keypair).await;

    let mut audio = harness.connect_audio().await;
    audio.write_all(&[2u8; 16]).await.unwrap();

    let mut status = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(12), audio.read_exact(&mut status))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status[0], b'2');

    harness.shutdown().await;
}

#[tokio::test]
async fn two_authenticated_legs_pair_and_relay() {
    let harness = Harness::start().await;
    let (alice, alice_key) = register_and_authenticate(&harness).await;
    let (bob, bob_key) = register_and_authenticate(&harness).await;
    let _alice_chat = keep_chat_session_alive(&harness, alice, &alice_key).await;
    let _bob_chat = keep_chat_session_alive(&harness, bob, &bob_key).await;

    let call_id = [0x99u8; 16];

    let mut alice_audio = harness.connect_audio().await;
    alice_audio.write_all(&call_id).await.unwrap();

    let mut bob_audio = harness.connect_audio().await;
    bob_audio.write_all(&call_id).await.unwrap();

    let mut status_a = [0u8; 1];
    alice_audio.read_exact(&mut status_a).await.unwrap();
    let mut status_b = [0u8; 1];
    bob_audio.read_exact(&mut status_b).await.unwrap();
    assert_eq!(status_a[0], b'1');
    assert_eq!(status_b[0], b'1');

    alice_audio.write_all(b"opaque-frame").await.unwrap();
    let mut got = [0u8; 12];
    bob_audio.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"opaque-frame");

    harness.shutdown().await;
}
