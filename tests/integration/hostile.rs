use std::net::SocketAddr;
use std::time::Duration;

use drift_core::crypto::{self, KEY_LEN, NONCE_LEN};
use drift_core::Keypair;
use drift_services::peer::{TXT_DISPLAY_NAME, TXT_PUBLIC_KEY};
use drift_services::{PeerEvent, SecureStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::*;

const QUIET: Duration = Duration::from_millis(500);

/// Tell `node` that `name` lives at `home`'s address and holds `keypair`.
fn register(node: &Node, home: &Node, name: &str, keypair: &Keypair) {
    let mut record = home.peer_record();
    record.instance = name.to_string();
    record.hostname = format!("{name}.local");
    record.txt = vec![
        format!("{TXT_DISPLAY_NAME}={name}"),
        format!("{TXT_PUBLIC_KEY}={}", keypair.public_hex()),
    ];
    node.registry.apply(PeerEvent::Added(record));
}

/// Wait for the far side to drop the connection.
async fn expect_closed<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(STEP_TIMEOUT, reader.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("peer sent {n} unexpected bytes"),
        Err(_) => panic!("connection was not closed"),
    }
}

fn addr_of(node: &Node) -> SocketAddr {
    SocketAddr::new(LOOPBACK, node.port)
}

#[tokio::test]
async fn unknown_address_is_closed() {
    let mut a = Node::start("alice").await.unwrap();
    let mut b = Node::start("bob").await.unwrap();
    a.discovers(&b);
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "hello.txt", 12);

    a.send("bob", vec![path]).await;

    assert_eq!(a.next_notification().await, "Unable to connect to peer: bob");
    b.expect_no_prompt(QUIET).await;
    assert!(b.downloaded().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn oversize_frame_is_rejected() {
    let mut b = Node::start("bob").await.unwrap();
    let mallory = Keypair::generate();
    register(&b, &b, "mallory", &mallory);

    let mut tcp = TcpStream::connect(addr_of(&b)).await.unwrap();
    let mut preamble = Vec::with_capacity(KEY_LEN + NONCE_LEN);
    preamble.extend_from_slice(&Keypair::generate().public);
    preamble.extend_from_slice(&crypto::random_nonce());
    tcp.write_all(&preamble).await.unwrap();

    let mut theirs = [0u8; KEY_LEN + NONCE_LEN];
    tokio::time::timeout(STEP_TIMEOUT, tcp.read_exact(&mut theirs))
        .await
        .unwrap()
        .unwrap();

    // 2 GiB length prefix followed by a little junk.
    tcp.write_all(&[0x80, 0, 0, 0, 1, 2, 3, 4]).await.unwrap();
    expect_closed(&mut tcp).await;

    b.expect_no_prompt(QUIET).await;
    assert!(b.downloaded().is_empty());
    b.shutdown().await;
}

#[tokio::test]
async fn silent_client_is_dropped_after_handshake_timeout() {
    let mut b = Node::start_with_handshake_timeout("bob", Duration::from_millis(300))
        .await
        .unwrap();
    register(&b, &b, "mallory", &Keypair::generate());

    let mut tcp = TcpStream::connect(addr_of(&b)).await.unwrap();
    let mut theirs = [0u8; KEY_LEN + NONCE_LEN];
    tokio::time::timeout(STEP_TIMEOUT, tcp.read_exact(&mut theirs))
        .await
        .unwrap()
        .unwrap();

    // Never send a preamble.
    expect_closed(&mut tcp).await;
    b.expect_no_prompt(QUIET).await;
    b.shutdown().await;
}

#[tokio::test]
async fn traversal_in_offer_is_rejected() {
    let mut b = Node::start("bob").await.unwrap();
    let mallory = Keypair::generate();
    register(&b, &b, "mallory", &mallory);

    let tcp = TcpStream::connect(addr_of(&b)).await.unwrap();
    let mut secure = SecureStream::handshake(tcp, &mallory, &b.keypair.public)
        .await
        .unwrap();
    secure
        .write_all(b"OFFER|../evil|application/octet-stream|3\n")
        .await
        .unwrap();
    secure.flush().await.unwrap();
    expect_closed(&mut secure).await;

    b.expect_no_prompt(QUIET).await;
    assert!(b.downloaded().is_empty());
    assert!(!b.downloads.path().parent().unwrap().join("evil").exists());
    b.shutdown().await;
}

#[tokio::test]
async fn extra_delimiter_in_offer_is_rejected() {
    let mut b = Node::start("bob").await.unwrap();
    let mallory = Keypair::generate();
    register(&b, &b, "mallory", &mallory);

    let tcp = TcpStream::connect(addr_of(&b)).await.unwrap();
    let mut secure = SecureStream::handshake(tcp, &mallory, &b.keypair.public)
        .await
        .unwrap();
    secure
        .write_all(b"OFFER|a|b.txt|text/plain|3\n")
        .await
        .unwrap();
    secure.flush().await.unwrap();
    expect_closed(&mut secure).await;

    b.expect_no_prompt(QUIET).await;
    assert!(b.downloaded().is_empty());
    b.shutdown().await;
}

#[tokio::test]
async fn sender_refuses_unencodable_filename() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "a|b.txt", 3);

    a.send("bob", vec![path]).await;

    let note = a.next_notification().await;
    assert!(note.starts_with("Transfer to bob failed"), "unexpected notification: {note}");
    b.expect_no_prompt(QUIET).await;
    assert!(b.downloaded().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn wrong_advertised_key_never_delivers() {
    let (mut a, mut b) = pair().await;
    // alice holds a stale key for bob.
    register(&a, &b, "bob", &Keypair::generate());
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "hello.txt", 12);

    a.send("bob", vec![path]).await;

    let note = a.next_notification().await;
    assert!(note.starts_with("Transfer to bob failed"), "unexpected notification: {note}");
    b.expect_no_prompt(QUIET).await;
    assert!(b.downloaded().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}
