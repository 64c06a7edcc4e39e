//! In-process cluster helpers shared by the integration tests

#![allow(dead_code)]

use replistore::common::{ControllerConfig, DstoreConfig};
use replistore::coordinator::ClusterStatus;
use replistore::dstore::FileStore;
use replistore::{Client, Controller, Coordinator, Dstore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const TIMEOUT_MS: u64 = 500;

pub struct TestController {
    pub port: u16,
    pub coordinator: Arc<Coordinator>,
    task: JoinHandle<replistore::Result<()>>,
}

impl Drop for TestController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct TestDstore {
    pub port: u16,
    pub store: FileStore,
    task: JoinHandle<replistore::Result<()>>,
    _dir: TempDir,
}

impl TestDstore {
    /// Kill the dstore; the controller sees its connection close.
    pub fn kill(&self) {
        self.task.abort();
    }
}

impl Drop for TestDstore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_controller(replication_factor: usize) -> TestController {
    let controller = Controller::bind(ControllerConfig {
        port: 0,
        replication_factor,
        timeout_ms: TIMEOUT_MS,
        rebalance_period_ms: 3_600_000,
        inbox_capacity: 16,
    })
    .await
    .unwrap();
    let port = controller.local_port().unwrap();
    let coordinator = controller.coordinator();
    let task = tokio::spawn(controller.serve());
    TestController {
        port,
        coordinator,
        task,
    }
}

/// Start a dstore and wait until the controller has registered it.
pub async fn start_dstore(controller: &TestController) -> TestDstore {
    let dir = TempDir::new().unwrap();
    let dstore = Dstore::bind(DstoreConfig {
        port: 0,
        controller_port: controller.port,
        timeout_ms: TIMEOUT_MS,
        data_dir: dir.path().to_path_buf(),
    })
    .await
    .unwrap();
    let port = dstore.port();
    let store = dstore.store().clone();
    let task = tokio::spawn(dstore.serve());

    wait_until(&controller.coordinator, |s| {
        s.nodes.iter().any(|(node, _)| *node == port)
    })
    .await;

    TestDstore {
        port,
        store,
        task,
        _dir: dir,
    }
}

pub async fn start_cluster(replication_factor: usize, dstores: usize) -> (TestController, Vec<TestDstore>) {
    let controller = start_controller(replication_factor).await;
    let mut nodes = Vec::with_capacity(dstores);
    for _ in 0..dstores {
        nodes.push(start_dstore(&controller).await);
    }
    (controller, nodes)
}

pub async fn client(controller: &TestController) -> Client {
    Client::connect(controller.port, Duration::from_secs(5))
        .await
        .unwrap()
}

/// Poll the controller status until `ready` holds, failing after five seconds.
pub async fn wait_until<F>(coordinator: &Arc<Coordinator>, ready: F) -> ClusterStatus
where
    F: Fn(&ClusterStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = coordinator.status();
        if ready(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "condition not reached: {:?}", status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
