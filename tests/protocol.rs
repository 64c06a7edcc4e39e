//! Wire-level controller tests with scripted dstores

mod common;

use common::{start_controller, wait_until, TestController, TIMEOUT_MS};
use replistore::coordinator::gate::GateState;
use replistore::coordinator::index::FileStatus;
use replistore::coordinator::RebalanceOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// A control connection that answers LIST with its configured listing and
/// hands every other command to the test. Without a listing, LIST is handed
/// over too.
struct ScriptedDstore {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    commands: mpsc::UnboundedReceiver<String>,
    listing: Arc<std::sync::Mutex<Option<String>>>,
}

impl ScriptedDstore {
    async fn join(controller: &TestController, port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", controller.port)).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        writer
            .write_all(format!("JOIN {}\n", port).as_bytes())
            .await
            .unwrap();
        let writer = Arc::new(Mutex::new(writer));
        let listing = Arc::new(std::sync::Mutex::new(Some("LIST".to_string())));

        let (tx, commands) = mpsc::unbounded_channel();
        let replies = writer.clone();
        let answer = listing.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let auto = if line == "LIST" {
                    answer.lock().unwrap().clone()
                } else {
                    None
                };
                if let Some(reply) = auto {
                    let _ = replies
                        .lock()
                        .await
                        .write_all(format!("{}\n", reply).as_bytes())
                        .await;
                } else if tx.send(line).is_err() {
                    return;
                }
            }
        });

        wait_until(&controller.coordinator, |s| {
            s.nodes.iter().any(|(node, _)| *node == port)
        })
        .await;
        Self {
            writer,
            commands,
            listing,
        }
    }

    /// Answer LIST with `line` from now on, or hand it to the test if `None`.
    fn answer_list(&self, line: Option<&str>) {
        *self.listing.lock().unwrap() = line.map(str::to_string);
    }

    async fn send(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    async fn next_command(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn assert_idle(&mut self) {
        let command = tokio::time::timeout(Duration::from_millis(100), self.commands.recv()).await;
        assert!(command.is_err(), "unexpected command: {:?}", command);
    }
}

struct RawClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    async fn connect(controller: &TestController) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", controller.port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn reply(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn assert_silent(&mut self) {
        let line = tokio::time::timeout(Duration::from_millis(100), self.lines.next_line()).await;
        assert!(line.is_err(), "unexpected reply: {:?}", line);
    }
}

#[tokio::test]
async fn test_store_and_remove_rounds() {
    let controller = start_controller(1).await;
    let mut dstore = ScriptedDstore::join(&controller, 40001).await;
    let mut client = RawClient::connect(&controller).await;

    client.send("STORE f 3").await;
    assert_eq!(client.reply().await, "STORE_TO 40001");
    dstore.send("STORE_ACK f").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");

    client.send("LIST").await;
    assert_eq!(client.reply().await, "LIST f");

    client.send("REMOVE f").await;
    assert_eq!(dstore.next_command().await, "REMOVE f");
    // Already gone on the dstore still counts
    dstore.send("ERROR_FILE_DOES_NOT_EXIST f").await;
    assert_eq!(client.reply().await, "REMOVE_COMPLETE");

    client.send("LIST").await;
    assert_eq!(client.reply().await, "LIST");
}

#[tokio::test]
async fn test_ack_from_non_target_not_counted() {
    let controller = start_controller(1).await;
    let _target = ScriptedDstore::join(&controller, 40011).await;
    let bystander = ScriptedDstore::join(&controller, 40012).await;
    let mut client = RawClient::connect(&controller).await;

    client.send("STORE g 1").await;
    assert_eq!(client.reply().await, "STORE_TO 40011");
    bystander.send("STORE_ACK g").await;

    tokio::time::sleep(Duration::from_millis(TIMEOUT_MS * 2)).await;
    assert!(controller.coordinator.placement("g").is_none());
    client.assert_silent().await;

    // Both dstores are still in the fleet
    assert_eq!(controller.coordinator.status().nodes.len(), 2);
}

#[tokio::test]
async fn test_remove_timeout_evicts_silent_dstore() {
    let controller = start_controller(2).await;
    let mut first = ScriptedDstore::join(&controller, 40021).await;
    let mut second = ScriptedDstore::join(&controller, 40022).await;
    let mut client = RawClient::connect(&controller).await;

    client.send("STORE h 4").await;
    assert_eq!(client.reply().await, "STORE_TO 40021 40022");
    first.send("STORE_ACK h").await;
    second.send("STORE_ACK h").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");

    client.send("REMOVE h").await;
    assert_eq!(first.next_command().await, "REMOVE h");
    assert_eq!(second.next_command().await, "REMOVE h");
    first.send("REMOVE_ACK h").await;

    let status = wait_until(&controller.coordinator, |s| s.nodes.len() == 1).await;
    assert_eq!(status.nodes[0].0, 40021);

    let record = controller.coordinator.placement("h").unwrap();
    assert_eq!(record.status, FileStatus::Removing);
    assert_eq!(record.replicas, vec![40021]);
    client.assert_silent().await;

    client.send("LIST").await;
    assert_eq!(client.reply().await, "ERROR_NOT_ENOUGH_DSTORES");
}

#[tokio::test]
async fn test_dstore_reply_garbage_tolerated() {
    let controller = start_controller(1).await;
    let dstore = ScriptedDstore::join(&controller, 40031).await;
    dstore.send("HELLO there").await;
    dstore.send("STORE_ACK nobody").await;

    let mut client = RawClient::connect(&controller).await;
    client.send("STORE k 1").await;
    assert_eq!(client.reply().await, "STORE_TO 40031");
    dstore.send("STORE_ACK k").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");
}

#[tokio::test]
async fn test_rejoin_forgets_previous_replicas() {
    let controller = start_controller(1).await;
    let first = ScriptedDstore::join(&controller, 40101).await;
    let mut client = RawClient::connect(&controller).await;

    client.send("STORE f 3").await;
    assert_eq!(client.reply().await, "STORE_TO 40101");
    first.send("STORE_ACK f").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");

    // Same port again, as after a restart that emptied its data directory
    let _second = ScriptedDstore::join(&controller, 40101).await;
    let status = wait_until(&controller.coordinator, |s| s.nodes == vec![(40101, 0)]).await;
    assert!(status.stored_files.is_empty());
    assert!(controller.coordinator.placement("f").is_none());

    client.send("LIST").await;
    assert_eq!(client.reply().await, "LIST");
    client.send("LOAD f").await;
    assert_eq!(client.reply().await, "ERROR_FILE_DOES_NOT_EXIST");

    // Closing the replaced connection does not evict the new one
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.coordinator.status().nodes, vec![(40101, 0)]);
}

#[tokio::test]
async fn test_rebalance_aborts_when_listings_missing() {
    let controller = start_controller(2).await;
    let first = ScriptedDstore::join(&controller, 40201).await;
    let mut second = ScriptedDstore::join(&controller, 40202).await;
    let mut client = RawClient::connect(&controller).await;

    client.send("STORE h 2").await;
    assert_eq!(client.reply().await, "STORE_TO 40201 40202");
    first.send("STORE_ACK h").await;
    second.send("STORE_ACK h").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");

    first.answer_list(Some("LIST h"));
    second.answer_list(None);
    let report = controller.coordinator.rebalance().await;
    assert_eq!(second.next_command().await, "LIST");

    assert!(matches!(report.outcome, RebalanceOutcome::Aborted(_)));
    assert_eq!(report.responders, 1);
    assert_eq!(report.pushed + report.evicted, 0);

    // The silent dstore is gone; the survivor's record stands as it was
    let status = controller.coordinator.status();
    assert_eq!(status.nodes, vec![(40201, 1)]);
    let record = controller.coordinator.placement("h").unwrap();
    assert_eq!(record.status, FileStatus::Stored);
    assert_eq!(record.replicas, vec![40201]);
}

#[tokio::test]
async fn test_rebalance_failure_keeps_previous_index() {
    let controller = start_controller(1).await;
    let first = ScriptedDstore::join(&controller, 40211).await;
    let mut second = ScriptedDstore::join(&controller, 40212).await;
    // The second join grew the fleet past r and ran a cycle
    wait_until(&controller.coordinator, |s| s.last_rebalance.is_some()).await;

    let mut client = RawClient::connect(&controller).await;
    client.send("STORE g 1").await;
    assert_eq!(client.reply().await, "STORE_TO 40211");
    first.send("STORE_ACK g").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");
    let before = controller.coordinator.placement("g").unwrap();

    first.answer_list(Some("LIST g"));
    second.answer_list(Some("LIST stray"));
    let coordinator = controller.coordinator.clone();
    let cycle = tokio::spawn(async move { coordinator.rebalance().await });

    // Told to drop the stray file, the dstore never reports completion
    assert_eq!(second.next_command().await, "REBALANCE 0 1 stray");
    let report = cycle.await.unwrap();
    assert!(
        matches!(report.outcome, RebalanceOutcome::Failed(_)),
        "{:?}",
        report.outcome
    );

    // Eviction has landed by the time the report is out
    let status = controller.coordinator.status();
    assert_eq!(status.nodes, vec![(40211, 1)]);
    assert_eq!(controller.coordinator.placement("g").unwrap(), before);
    assert!(controller.coordinator.placement("stray").is_none());
}

#[tokio::test]
async fn test_requests_held_during_rebalance() {
    let controller = start_controller(1).await;
    let mut dstore = ScriptedDstore::join(&controller, 40301).await;
    let mut writer = RawClient::connect(&controller).await;
    let mut reader = RawClient::connect(&controller).await;

    dstore.answer_list(None);
    let coordinator = controller.coordinator.clone();
    let cycle = tokio::spawn(async move { coordinator.rebalance().await });
    assert_eq!(dstore.next_command().await, "LIST");
    assert_eq!(controller.coordinator.status().gate, GateState::Frozen);

    writer.send("STORE a 1").await;
    writer.send("REMOVE a").await;
    writer.assert_silent().await;
    dstore.assert_idle().await;

    // Requests that leave placement alone are served while frozen
    reader.send("LIST").await;
    assert_eq!(reader.reply().await, "LIST");

    dstore.send("LIST").await;
    assert_eq!(cycle.await.unwrap().outcome, RebalanceOutcome::Balanced);

    // Held requests run afterwards, in the order they were sent
    assert_eq!(writer.reply().await, "STORE_TO 40301");
    dstore.send("STORE_ACK a").await;
    assert_eq!(writer.reply().await, "STORE_COMPLETE");
    assert_eq!(dstore.next_command().await, "REMOVE a");
    dstore.send("REMOVE_ACK a").await;
    assert_eq!(writer.reply().await, "REMOVE_COMPLETE");
    assert!(controller.coordinator.placement("a").is_none());
}

#[tokio::test]
async fn test_rebalance_clears_stuck_removal() {
    let controller = start_controller(2).await;
    let mut first = ScriptedDstore::join(&controller, 40401).await;
    let mut second = ScriptedDstore::join(&controller, 40402).await;
    let _third = ScriptedDstore::join(&controller, 40403).await;
    wait_until(&controller.coordinator, |s| s.last_rebalance.is_some()).await;
    let mut client = RawClient::connect(&controller).await;

    client.send("STORE h 4").await;
    assert_eq!(client.reply().await, "STORE_TO 40401 40402");
    first.send("STORE_ACK h").await;
    second.send("STORE_ACK h").await;
    assert_eq!(client.reply().await, "STORE_COMPLETE");

    client.send("REMOVE h").await;
    assert_eq!(first.next_command().await, "REMOVE h");
    assert_eq!(second.next_command().await, "REMOVE h");
    first.send("REMOVE_ACK h").await;
    wait_until(&controller.coordinator, |s| s.nodes.len() == 2).await;
    assert_eq!(
        controller.coordinator.placement("h").unwrap().status,
        FileStatus::Removing
    );

    // The acknowledging holder still lists h
    first.answer_list(Some("LIST h"));
    let coordinator = controller.coordinator.clone();
    let cycle = tokio::spawn(async move { coordinator.rebalance().await });
    assert_eq!(first.next_command().await, "REBALANCE 0 1 h");
    first.send("REBALANCE_COMPLETE").await;

    let report = cycle.await.unwrap();
    assert_eq!(report.outcome, RebalanceOutcome::Completed);
    assert_eq!(report.evicted, 1);
    assert!(controller.coordinator.placement("h").is_none());
    let status = controller.coordinator.status();
    assert_eq!(status.nodes, vec![(40401, 0), (40403, 0)]);
    assert!(status.stored_files.is_empty());
}
