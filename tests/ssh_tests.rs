//! Host verification through the real russh handshake, against an in-process
//! SSH server on loopback.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{self, Auth};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use fleet_lite::error::FleetError;
use fleet_lite::transport::{HostVerifier, KnownHosts, SecureTransport, SshConnector, SshTarget};

fn ed25519() -> KeyPair {
    KeyPair::Ed25519(ed25519_dalek::SigningKey::from_bytes(
        &rand::random::<[u8; 32]>(),
    ))
}

fn public_base64(key: &KeyPair) -> String {
    key.clone_public_key().unwrap().public_key_base64()
}

struct AcceptAll;

#[async_trait]
impl server::Handler for AcceptAll {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }
}

struct TestServer {
    port: u16,
    accepts: Arc<AtomicUsize>,
    host_key: String,
}

/// Serve SSH on 127.0.0.1 with a fresh host key, counting TCP accepts.
async fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let key = ed25519();
    let host_key = public_base64(&key);
    let config = Arc::new(server::Config {
        keys: vec![key],
        ..Default::default()
    });
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(session) = server::run_stream(config, stream, AcceptAll).await {
                    let _ = session.await;
                }
            });
        }
    });

    TestServer {
        port,
        accepts,
        host_key,
    }
}

async fn strict_transport(store: KnownHosts) -> SecureTransport {
    let connector = SshConnector::new(Arc::new(ed25519()), HostVerifier::Strict(Arc::new(store)));
    SecureTransport::new(Arc::new(connector), test_harness::test_ssh_config())
}

#[tokio::test]
async fn test_rotated_host_key_is_rejected_once() {
    let server = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = KnownHosts::open(dir.path().join("known_hosts")).await.unwrap();
    store
        .trust("127.0.0.1", server.port, "ssh-ed25519", &public_base64(&ed25519()))
        .await
        .unwrap();
    let transport = strict_transport(store).await;

    let result = transport
        .dial(
            &SshTarget::new("127.0.0.1", server.port, "gx"),
            &CancellationToken::new(),
        )
        .await;

    match result {
        Err(FleetError::HostKeyMismatch { host }) => {
            assert_eq!(host, format!("127.0.0.1:{}", server.port))
        }
        Err(other) => panic!("expected host key mismatch, got {}", other),
        Ok(_) => panic!("connected to a host with an untrusted key"),
    }
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_host_is_rejected_once() {
    let server = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = KnownHosts::open(dir.path().join("known_hosts")).await.unwrap();
    let transport = strict_transport(store).await;

    let result = transport
        .dial(
            &SshTarget::new("127.0.0.1", server.port, "gx"),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(FleetError::UnknownHost { .. })));
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trusted_host_key_connects() {
    let server = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store = KnownHosts::open(dir.path().join("known_hosts")).await.unwrap();
    store
        .trust("127.0.0.1", server.port, "ssh-ed25519", &server.host_key)
        .await
        .unwrap();
    let transport = strict_transport(store).await;

    let result = transport
        .dial(
            &SshTarget::new("127.0.0.1", server.port, "gx"),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.is_ok(), "dial failed: {:?}", result.err());
    assert_eq!(server.accepts.load(Ordering::SeqCst), 1);
}
