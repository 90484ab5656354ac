use std::time::Duration;

use drift_core::Answer;
use drift_services::{FileInfo, Prompt};

use crate::*;

#[tokio::test]
async fn single_file_accepted() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = outbox.path().join("hello.txt");
    std::fs::write(&path, b"hello, world").unwrap();

    a.send("bob", vec![path.clone()]).await;

    let Prompt::Single { id, question } = b.next_prompt().await else {
        panic!("expected a single-file prompt");
    };
    assert_eq!(question, "Incoming file: hello.txt (12 Bytes)");
    assert!(b.gateway.answer(id, Answer::Accept));

    assert_eq!(b.next_notification().await, "File received: hello.txt");
    assert_eq!(
        a.next_notification().await,
        format!("File sent: {}", path.display())
    );
    assert_eq!(b.downloaded(), vec!["hello.txt"]);
    assert_eq!(
        std::fs::read(b.downloads.path().join("hello.txt")).unwrap(),
        b"hello, world"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn declined_offer_writes_nothing() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "secret.bin", 4096);

    a.send("bob", vec![path]).await;
    let prompt = b.next_prompt().await;
    assert!(b.gateway.answer(prompt.id(), Answer::Decline));

    assert_eq!(a.next_notification().await, "bob declined the transfer");
    assert!(b.downloaded().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn batch_of_three_files() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let paths = vec![
        write_file(outbox.path(), "one.txt", 100),
        write_file(outbox.path(), "two.txt", 200),
        write_file(outbox.path(), "three.txt", 300),
    ];

    a.send("bob", paths.clone()).await;

    let Prompt::Batch { id, peer, files } = b.next_prompt().await else {
        panic!("expected a batch prompt");
    };
    assert_eq!(peer, "alice");
    assert_eq!(
        files,
        vec![
            FileInfo { name: "one.txt".into(), size: 100 },
            FileInfo { name: "two.txt".into(), size: 200 },
            FileInfo { name: "three.txt".into(), size: 300 },
        ]
    );
    b.gateway.answer(id, Answer::Accept);

    assert_eq!(b.next_notification().await, "Batch received: 3 files");
    assert_eq!(a.next_notification().await, "Batch sent: 3 files");
    assert_eq!(b.downloaded(), vec!["one.txt", "three.txt", "two.txt"]);
    for path in &paths {
        let name = path.file_name().unwrap();
        assert_eq!(
            std::fs::read(b.downloads.path().join(name)).unwrap(),
            std::fs::read(path).unwrap()
        );
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn large_file_spans_many_frames() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "video.raw", 5 * 1024 * 1024 + 17);

    a.send("bob", vec![path.clone()]).await;
    let Prompt::Single { id, question } = b.next_prompt().await else {
        panic!("expected a single-file prompt");
    };
    assert_eq!(question, "Incoming file: video.raw (5.00 MiB)");
    b.gateway.answer(id, Answer::Accept);

    assert_eq!(b.next_notification().await, "File received: video.raw");
    a.next_notification().await;
    assert_eq!(
        std::fs::read(b.downloads.path().join("video.raw")).unwrap(),
        std::fs::read(&path).unwrap()
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn empty_file_round_trip() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "empty", 0);

    a.send("bob", vec![path]).await;
    let prompt = b.next_prompt().await;
    b.gateway.answer(prompt.id(), Answer::Accept);

    assert_eq!(b.next_notification().await, "File received: empty");
    assert_eq!(std::fs::metadata(b.downloads.path().join("empty")).unwrap().len(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn existing_file_is_not_overwritten() {
    let (a, mut b) = pair().await;
    std::fs::write(b.downloads.path().join("notes.txt"), b"keep me").unwrap();
    let outbox = tempfile::tempdir().unwrap();
    let path = outbox.path().join("notes.txt");
    std::fs::write(&path, b"new notes").unwrap();

    a.send("bob", vec![path]).await;
    let prompt = b.next_prompt().await;
    b.gateway.answer(prompt.id(), Answer::Accept);
    b.next_notification().await;

    assert_eq!(b.downloaded(), vec!["notes (1).txt", "notes.txt"]);
    assert_eq!(std::fs::read(b.downloads.path().join("notes.txt")).unwrap(), b"keep me");
    assert_eq!(
        std::fs::read(b.downloads.path().join("notes (1).txt")).unwrap(),
        b"new notes"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unanswered_prompt_times_out_as_decline() {
    let mut a = Node::start("alice").await.unwrap();
    let mut b = Node::start_with_timeout("bob", Duration::from_millis(200)).await.unwrap();
    a.discovers(&b);
    b.discovers(&a);
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "late.txt", 10);

    a.send("bob", vec![path]).await;
    b.next_prompt().await;

    assert_eq!(a.next_notification().await, "bob declined the transfer");
    assert!(b.downloaded().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn unknown_recipient_is_reported() {
    let (mut a, b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "x", 1);

    a.send("carol", vec![path]).await;
    assert_eq!(a.next_notification().await, "User carol not found");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn peer_gone_from_registry_is_not_found() {
    let (mut a, b) = pair().await;
    a.registry
        .apply(drift_services::PeerEvent::Removed(b.peer_record().service_name()));
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "x", 1);

    a.send("bob", vec![path]).await;
    assert_eq!(a.next_notification().await, "User bob not found");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn shutdown_declines_open_prompt() {
    let (mut a, mut b) = pair().await;
    let outbox = tempfile::tempdir().unwrap();
    let path = write_file(outbox.path(), "pending.txt", 10);

    a.send("bob", vec![path]).await;
    b.next_prompt().await;
    b.shutdown().await;

    let note = a.next_notification().await;
    assert!(
        note == "bob declined the transfer" || note.starts_with("Transfer to bob failed"),
        "unexpected notification: {note}"
    );
    a.shutdown().await;
}
