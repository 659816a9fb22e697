//! Shared end-to-end harness for retro-server's integration tests: spins
//! up all three listeners on ephemeral ports with a throwaway
//! self-signed cert, and gives each test a TLS client connector trusting
//! exactly that cert.

use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retro_server::config::ServerConfig;
use retro_server::server::{self, Listeners};
use retro_server::state::ServerState;
use retro_server::tls;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub struct Harness {
    pub config: ServerConfig,
    pub state: Arc<ServerState>,
    pub listeners: Listeners,
    client_config: Arc<ClientConfig>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        ensure_crypto_provider();

        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::defaults(dir.path());
        config.server_port = 0;
        config.fileserver_enabled = true;
        config.fileserver_port = 0;
        config.audioserver_enabled = true;
        config.audioserver_port = 0;
        config.recv_timeout = Duration::from_secs(2);
        config.accept_timeout = Duration::from_millis(50);
        configure(&mut config);

        fs::create_dir_all(config.certfile.parent().unwrap()).unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        fs::write(&config.certfile, cert.cert.pem()).unwrap();
        fs::write(&config.keyfile, cert.key_pair.serialize_pem()).unwrap();

        let server_certs = tls::load_certs(&config.certfile).unwrap();
        let server_key = tls::load_key(&config.keyfile).unwrap();
        let tls_server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(server_certs, server_key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(tls_server_config));

        let state = Arc::new(ServerState::open(&config).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (listeners, handles) =
            server::spawn_listeners(&config, state.clone(), acceptor, shutdown.clone())
                .await
                .unwrap();

        let mut roots = RootCertStore::empty();
        for der in tls::load_certs(&config.certfile).unwrap() {
            roots.add(der).unwrap();
        }
        let client_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        Harness {
            config,
            state,
            listeners,
            client_config,
            shutdown,
            handles,
            _dir: dir,
        }
    }

    pub async fn connect_chat(&self) -> ClientTlsStream<TcpStream> {
        self.connect(self.listeners.chat_addr).await
    }

    pub async fn connect_file(&self) -> ClientTlsStream<TcpStream> {
        self.connect(self.listeners.file_addr.expect("fileserver enabled in tests")).await
    }

    /// Plaintext connection to the audio listener — no TLS, per spec.
    pub async fn connect_audio(&self) -> TcpStream {
        TcpStream::connect(self.listeners.audio_addr.expect("audioserver enabled in tests"))
            .await
            .unwrap()
    }

    async fn connect(&self, addr: SocketAddr) -> ClientTlsStream<TcpStream> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(self.client_config.clone());
        let name = ServerName::try_from("localhost").unwrap();
        connector.connect(name, tcp).await.unwrap()
    }

    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
    }
}

/// A fresh Ed25519 keypair plus its raw public key bytes, in the
/// on-disk encoding `retro_crypto::PublicKey` expects.
pub fn generate_keypair() -> (Ed25519KeyPair, Vec<u8>) {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
    let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
    let public_key = keypair.public_key().as_ref().to_vec();
    (keypair, public_key)
}
