//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use custodian::backup::transport::RemoteWriter;
use custodian::backup::{
    BackupContext, BackupReporter, BackupSettings, ConfigLockConfig, FsBackupStorage,
    FsTransport, RemoteTransport, SchedulerConfigStore, TransportFactory,
};
use custodian::clock::ManualClock;
use custodian::cluster::{StaticTopology, TokenRange};
use custodian::coordination::{CoordinatorStore, LeaseManager};
use custodian::repair::{NotificationSender, RepairFacility, RepairNotification, RepairStatus};
use custodian::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

pub const NODES: [&str; 3] = ["node1", "node2", "node3"];
pub const SITE: &str = "site1";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 0, 45, 0).unwrap()
}

/// What the scripted facility does for one range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Report success and completion
    Finish,
    /// Report a failed session
    Fail,
    /// Nothing to repair
    Skip,
    /// Never report anything
    Hang,
    /// Refuse to start the command
    Refuse,
}

/// Repair facility answering each call according to a script
pub struct ScriptedFacility {
    sender: Mutex<Option<NotificationSender>>,
    default_step: Step,
    steps: Mutex<HashMap<usize, Step>>,
    calls: Mutex<Vec<TokenRange>>,
    next_command: AtomicI32,
    terminations: AtomicUsize,
    finish_on_terminate: AtomicBool,
    on_call: Mutex<Option<(usize, Arc<StaticTopology>)>>,
}

impl ScriptedFacility {
    pub fn new(default_step: Step) -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(None),
            default_step,
            steps: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_command: AtomicI32::new(1),
            terminations: AtomicUsize::new(0),
            finish_on_terminate: AtomicBool::new(false),
            on_call: Mutex::new(None),
        })
    }

    pub fn attach(&self, sender: NotificationSender) {
        *self.sender.lock() = Some(sender);
    }

    /// Use `step` for the `call`-th repair command (zero based).
    pub fn script(&self, call: usize, step: Step) {
        self.steps.lock().insert(call, step);
    }

    /// Take `node3` down while serving the `call`-th command.
    pub fn change_topology_at(&self, call: usize, topology: Arc<StaticTopology>) {
        *self.on_call.lock() = Some((call, topology));
    }

    /// Report the running command as finished when sessions are terminated.
    pub fn finish_late_on_terminate(&self) {
        self.finish_on_terminate.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TokenRange> {
        self.calls.lock().clone()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    fn send(&self, notification: RepairNotification) {
        if let Some(sender) = self.sender.lock().as_ref() {
            sender.try_send(notification).unwrap();
        }
    }
}

#[async_trait]
impl RepairFacility for ScriptedFacility {
    async fn force_repair_range_async(&self, range: &TokenRange, _keyspace: &str) -> Result<i32> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(*range);
            calls.len() - 1
        };

        let hook = self.on_call.lock().clone();
        if let Some((at, topology)) = hook {
            if at == call {
                topology
                    .set_status("node3", custodian::cluster::NodeStatus::Down)
                    .await;
            }
        }

        let step = self
            .steps
            .lock()
            .get(&call)
            .copied()
            .unwrap_or(self.default_step);
        if step == Step::Refuse {
            return Err(Error::Repair("refused".to_string()));
        }
        if step == Step::Skip {
            return Ok(0);
        }

        let command = self.next_command.fetch_add(1, Ordering::SeqCst);
        match step {
            Step::Finish => {
                self.send(RepairNotification::repair(command, RepairStatus::Started, "started"));
                self.send(RepairNotification::repair(
                    command,
                    RepairStatus::SessionSuccess,
                    "session done",
                ));
                self.send(RepairNotification::repair(command, RepairStatus::Finished, "finished"));
            }
            Step::Fail => {
                self.send(RepairNotification::repair(command, RepairStatus::Started, "started"));
                self.send(RepairNotification::repair(
                    command,
                    RepairStatus::SessionFailed,
                    "session failed",
                ));
            }
            _ => {}
        }
        Ok(command)
    }

    async fn force_terminate_all_repair_sessions(&self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.finish_on_terminate.load(Ordering::SeqCst) {
            let command = self.next_command.load(Ordering::SeqCst) - 1;
            self.send(RepairNotification::repair(
                command,
                RepairStatus::SessionSuccess,
                "session done",
            ));
            self.send(RepairNotification::repair(command, RepairStatus::Finished, "finished"));
        }
        Ok(())
    }
}

/// Three-node ring with `node1` local.
pub fn topology() -> Arc<StaticTopology> {
    topology_at(SITE)
}

pub fn topology_at(site: &str) -> Arc<StaticTopology> {
    Arc::new(StaticTopology::evenly_spaced(&NODES, "node1", site, 4).unwrap())
}

/// Wraps a writer and counts the bytes written through it
struct CountingWriter {
    inner: RemoteWriter,
    bytes: Arc<AtomicU64>,
}

impl AsyncWrite for CountingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let bytes = self.bytes.clone();
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            bytes.fetch_add(*n as u64, Ordering::SeqCst);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Directory transport that counts every operation and written byte
pub struct CountingTransport {
    inner: FsTransport,
    ops: AtomicUsize,
    bytes: Arc<AtomicU64>,
    failing_opens: AtomicUsize,
}

impl CountingTransport {
    pub fn new(root: &std::path::Path) -> Arc<Self> {
        Arc::new(Self {
            inner: FsTransport::new(root),
            ops: AtomicUsize::new(0),
            bytes: Arc::new(AtomicU64::new(0)),
            failing_opens: AtomicUsize::new(0),
        })
    }

    pub fn ops(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` calls to `open_upload`.
    pub fn fail_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    fn op(&self) {
        self.ops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteTransport for CountingTransport {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        self.op();
        self.inner.list_files(prefix).await
    }

    async fn file_size(&self, name: &str) -> Result<Option<u64>> {
        self.op();
        self.inner.file_size(name).await
    }

    async fn open_upload(&self, name: &str, offset: u64) -> Result<RemoteWriter> {
        self.op();
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Transport("connection refused".to_string()));
        }
        let inner = self.inner.open_upload(name, offset).await?;
        Ok(Box::new(CountingWriter {
            inner,
            bytes: self.bytes.clone(),
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.op();
        self.inner.rename(from, to).await
    }
}

/// Hands out the same transport for every URL
pub struct FixedTransportFactory(pub Arc<CountingTransport>);

impl TransportFactory for FixedTransportFactory {
    fn create(&self, _url: &str) -> Result<Arc<dyn RemoteTransport>> {
        Ok(self.0.clone())
    }
}

/// Backup collaborators on temporary directories
pub struct BackupFixture {
    pub backups: tempfile::TempDir,
    pub remote: tempfile::TempDir,
    pub store: Arc<CoordinatorStore>,
    pub clock: Arc<ManualClock>,
    pub config: Arc<SchedulerConfigStore>,
    pub transport: Arc<CountingTransport>,
    pub ctx: BackupContext,
}

impl BackupFixture {
    pub fn new() -> Self {
        Self::at_site(SITE)
    }

    pub fn at_site(site: &str) -> Self {
        Self::with_store(site, Arc::new(CoordinatorStore::in_memory()))
    }

    pub fn with_store(site: &str, store: Arc<CoordinatorStore>) -> Self {
        let backups = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let leases = LeaseManager::new(store.clone(), clock.clone());
        let config = Arc::new(SchedulerConfigStore::new(
            store.clone(),
            leases,
            "node1",
            ConfigLockConfig::default(),
        ));
        let transport = CountingTransport::new(remote.path());

        let ctx = BackupContext {
            config: config.clone(),
            storage: Arc::new(FsBackupStorage::new(backups.path(), "node1", None)),
            topology: topology_at(site),
            transports: Arc::new(FixedTransportFactory(transport.clone())),
            reporter: BackupReporter::logging("node1", site),
            clock: clock.clone(),
            software_version: "3.6.1".to_string(),
        };

        Self {
            backups,
            remote,
            store,
            clock,
            config,
            transport,
            ctx,
        }
    }

    pub async fn configure(&self, settings: BackupSettings) {
        self.config.save_settings(&settings).await.unwrap();
    }

    /// Settings with uploads to the fixture's remote directory.
    pub fn upload_settings() -> BackupSettings {
        BackupSettings {
            upload_url: Some("file:///remote".to_string()),
            ..Default::default()
        }
    }

    /// Create `tag` on the given nodes, each with one data file.
    pub async fn create_backup(&self, tag: &str, nodes: &[&str]) {
        use custodian::backup::BackupStorage;
        for node in nodes {
            let data = tempfile::tempdir().unwrap();
            std::fs::write(data.path().join("data.db"), format!("{} of {}", tag, node).repeat(200))
                .unwrap();
            FsBackupStorage::new(self.backups.path(), *node, Some(data.path().to_path_buf()))
                .create_backup(tag)
                .await
                .unwrap();
        }
    }

    pub fn remote_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.remote.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}
