//! End-to-end tests against an in-process controller and dstores

mod common;

use common::{client, start_cluster, wait_until, TIMEOUT_MS};
use replistore::coordinator::index::FileStatus;
use replistore::Error;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_store_list_load_remove() {
    let (controller, dstores) = start_cluster(2, 3).await;
    let mut client = client(&controller).await;

    client.store("x", b"hello world").await.unwrap();
    assert_eq!(client.list().await.unwrap(), vec!["x"]);

    // Two least-loaded dstores, ties broken by join order
    let record = controller.coordinator.placement("x").unwrap();
    assert_eq!(record.status, FileStatus::Stored);
    assert_eq!(record.size, 11);
    let mut holders = record.replicas.clone();
    holders.sort_unstable();
    let mut expected = vec![dstores[0].port, dstores[1].port];
    expected.sort_unstable();
    assert_eq!(holders, expected);
    for dstore in &dstores[..2] {
        assert_eq!(dstore.store.get("x").await.unwrap(), Some(b"hello world".to_vec()));
    }
    assert_eq!(dstores[2].store.get("x").await.unwrap(), None);

    assert_eq!(client.load("x").await.unwrap(), b"hello world");

    client.remove("x").await.unwrap();
    assert!(client.list().await.unwrap().is_empty());
    assert!(controller.coordinator.placement("x").is_none());
    for dstore in &dstores {
        assert!(dstore.store.list().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_admission_errors() {
    let (controller, _dstores) = start_cluster(2, 2).await;
    let mut client = client(&controller).await;

    client.store("dup", b"1").await.unwrap();
    assert!(matches!(
        client.store("dup", b"2").await,
        Err(Error::FileAlreadyExists(_))
    ));
    assert!(matches!(
        client.load("missing").await,
        Err(Error::FileDoesNotExist(_))
    ));
    assert!(matches!(
        client.remove("missing").await,
        Err(Error::FileDoesNotExist(_))
    ));
}

#[tokio::test]
async fn test_not_enough_dstores() {
    let (controller, _dstores) = start_cluster(3, 2).await;
    let mut client = client(&controller).await;

    match client.store("y", b"0123456789").await {
        Err(Error::Rejected(token)) => assert_eq!(token, "ERROR_NOT_ENOUGH_DSTORES"),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(matches!(client.list().await, Err(Error::Rejected(_))));
    assert!(controller.coordinator.placement("y").is_none());
}

#[tokio::test]
async fn test_store_without_upload_rolls_back() {
    let (controller, _dstores) = start_cluster(2, 2).await;

    let stream = TcpStream::connect(("127.0.0.1", controller.port)).await.unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    writer.write_all(b"STORE z 5\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.starts_with("STORE_TO "), "{}", reply);
    assert_eq!(
        controller.coordinator.placement("z").map(|r| r.status),
        Some(FileStatus::Storing)
    );

    // While Storing, the name is taken and not yet listed
    let mut other = client(&controller).await;
    assert!(matches!(
        other.store("z", b"12345").await,
        Err(Error::FileAlreadyExists(_))
    ));
    assert!(other.list().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(TIMEOUT_MS * 2)).await;
    assert!(controller.coordinator.placement("z").is_none());

    // No reply is sent for the failed store
    let silent = tokio::time::timeout(Duration::from_millis(100), lines.next_line()).await;
    assert!(silent.is_err());

    other.store("z", b"12345").await.unwrap();
    assert_eq!(other.list().await.unwrap(), vec!["z"]);
}

#[tokio::test]
async fn test_remove_counts_missing_replica() {
    let (controller, dstores) = start_cluster(2, 2).await;
    let mut client = client(&controller).await;

    client.store("r", b"data").await.unwrap();
    assert!(dstores[0].store.remove("r").await.unwrap());

    client.remove("r").await.unwrap();
    assert!(controller.coordinator.placement("r").is_none());
    assert!(dstores[1].store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_falls_back_to_next_replica() {
    let (controller, dstores) = start_cluster(2, 2).await;
    let mut client = client(&controller).await;

    client.store("f", b"payload").await.unwrap();
    let first = controller.coordinator.placement("f").unwrap().replicas[0];
    let holder = dstores.iter().find(|d| d.port == first).unwrap();
    holder.store.remove("f").await.unwrap();

    assert_eq!(client.load("f").await.unwrap(), b"payload");

    for dstore in &dstores {
        dstore.store.remove("f").await.unwrap();
    }
    assert!(matches!(client.load("f").await, Err(Error::LoadExhausted(_))));
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (controller, _dstores) = start_cluster(1, 1).await;
    let mut c = client(&controller).await;
    c.store("a", b"1").await.unwrap();

    let stream = TcpStream::connect(("127.0.0.1", controller.port)).await.unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    writer
        .write_all(b"BOGUS\nLIST\nLOAD nope\nLIST\n")
        .await
        .unwrap();

    assert_eq!(lines.next_line().await.unwrap().unwrap(), "LIST a");
    assert_eq!(
        lines.next_line().await.unwrap().unwrap(),
        "ERROR_FILE_DOES_NOT_EXIST"
    );
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "LIST a");
}

#[tokio::test]
async fn test_dstore_failure_evicts_node() {
    let (controller, dstores) = start_cluster(1, 2).await;
    let mut client = client(&controller).await;
    client.store("only", b"1").await.unwrap();

    let holder = controller.coordinator.placement("only").unwrap().replicas[0];
    dstores.iter().find(|d| d.port == holder).unwrap().kill();

    let status = wait_until(&controller.coordinator, |s| s.nodes.len() == 1).await;
    assert!(status.nodes.iter().all(|(node, _)| *node != holder));
    // Its sole replica went with it
    assert!(status.stored_files.is_empty());
    assert!(client.list().await.unwrap().is_empty());
}
