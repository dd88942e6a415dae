use std::io::{Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use wiretap::capture::{Direction, GroupedTraffic, TrafficQuery};
use wiretap::telemetry::AuditLogger;
use wiretap::tls::client_config;
use wiretap::Wiretap;

/// TLS server for `localhost` answering one "ping" with "pong".
async fn pong_server() -> (u16, CertificateDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("Failed to generate certificate");
    let cert_der = cert.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key.into())
        .expect("Failed to build server config");
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind TLS server");
    let port = listener.local_addr().expect("No local addr").port();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut buf = [0u8; 4];
                if tls.read_exact(&mut buf).await.is_ok() && &buf == b"ping" {
                    let _ = tls.write_all(b"pong").await;
                    let _ = tls.flush().await;
                }
            });
        }
    });

    (port, cert_der)
}

fn trusting(cert: CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(cert).expect("Failed to add root");
    client_config(roots)
}

fn joined(traffic: &GroupedTraffic, direction: Direction) -> Vec<u8> {
    traffic
        .iter()
        .flat_map(|bucket| bucket.packets.iter())
        .filter(|p| p.direction() == direction)
        .flat_map(|p| p.payload().iter().copied())
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn attached() -> Wiretap {
    let wiretap = Wiretap::with_audit(Arc::new(AuditLogger::new_null()));
    wiretap.attach();
    wiretap
}

#[tokio::test]
async fn test_async_tls_plaintext_captured() {
    let (port, cert) = pong_server().await;
    let wiretap = attached();
    let session = wiretap.start_session();

    let tcp = wiretap
        .interceptor()
        .connect_async("127.0.0.1", port)
        .await
        .expect("connect");
    let mut tls = wiretap
        .tls_client(trusting(cert))
        .connect("localhost", tcp)
        .await
        .expect("handshake");
    assert!(tls.is_attached());

    tls.write_all(b"ping").await.expect("write");
    tls.flush().await.expect("flush");
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"pong");

    let plaintext = session.captured_traffic(&TrafficQuery::new().plaintext());
    assert_eq!(plaintext.len(), 1);
    assert_eq!(joined(&plaintext, Direction::Sent), b"ping");
    assert_eq!(joined(&plaintext, Direction::Received), b"pong");

    let wire = session.captured_traffic(&TrafficQuery::new());
    let wire_sent = joined(&wire, Direction::Sent);
    assert!(wire_sent.len() > 4);
    assert!(!contains(&wire_sent, b"ping"));

    // Both layers belong to the same connection.
    let plain_conn = plaintext.keys().next().expect("key").connection();
    let wire_conn = wire.keys().next().expect("key").connection();
    assert_eq!(plain_conn, wire_conn);
}

#[tokio::test]
async fn test_blocking_tls_plaintext_captured() {
    let (port, cert) = pong_server().await;
    let wiretap = Arc::new(attached());
    let session = wiretap.start_session();

    let client = Arc::clone(&wiretap);
    let reply = tokio::task::spawn_blocking(move || {
        let tcp = client
            .interceptor()
            .connect("127.0.0.1", port)
            .expect("connect");
        let mut tls = client
            .tls_client(trusting(cert))
            .connect_blocking("localhost", tcp)
            .expect("handshake");
        tls.write_all(b"ping").expect("write");
        tls.flush().expect("flush");
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).expect("read");
        buf
    })
    .await
    .expect("client task");
    assert_eq!(&reply, b"pong");

    let plaintext = session.captured_traffic(&TrafficQuery::new().plaintext());
    assert_eq!(joined(&plaintext, Direction::Sent), b"ping");
    assert_eq!(joined(&plaintext, Direction::Received), b"pong");

    let wire = session.captured_traffic(&TrafficQuery::new());
    assert!(!contains(&joined(&wire, Direction::Sent), b"ping"));
}

#[tokio::test]
async fn test_untrusted_certificate_fails_handshake() {
    let (port, _cert) = pong_server().await;
    let wiretap = attached();

    let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("Failed to generate certificate");
    let tcp = wiretap
        .interceptor()
        .connect_async("127.0.0.1", port)
        .await
        .expect("connect");
    let result = wiretap
        .tls_client(trusting(other.cert.der().clone()))
        .connect("localhost", tcp)
        .await;

    assert!(matches!(result, Err(wiretap::tls::TlsError::Handshake { .. })));
}
