//! Per-(index, node label) write batching.
//!
//! Each key owns a bounded channel and a worker task. The worker wakes every
//! flush interval, sends up to `batch_size` documents in one bulk request, and
//! exits as soon as a wake finds its queue empty. Writers that race a retiring
//! worker get their document back and re-enqueue onto a fresh one. Bulk
//! failures outlive the worker that hit them and surface on the next `flush`
//! or `close`.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use chunkdb_core::config::RemoteSettings;
use chunkdb_core::retry::RetryPolicy;
use chunkdb_core::{Error, Result};

use crate::client::RemoteClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub index: String,
    pub node_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub capacity: usize,
}

impl From<&RemoteSettings> for BatchSettings {
    fn from(settings: &RemoteSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
            capacity: settings.queue_capacity.max(1),
        }
    }
}

/// Wake-up signal shared by a worker and whoever asks it to drain now.
#[derive(Default)]
struct Drain {
    requested: AtomicBool,
    notify: Notify,
}

struct Worker {
    id: u64,
    sender: mpsc::Sender<Value>,
    drain: Arc<Drain>,
    handle: JoinHandle<()>,
}

type Workers = Mutex<HashMap<QueueKey, Worker>>;

/// First bulk failure per key, held until `flush` or `close` reports it.
type Failures = Mutex<HashMap<QueueKey, Error>>;

pub struct BatchQueue {
    client: RemoteClient,
    settings: BatchSettings,
    retry: RetryPolicy,
    workers: Arc<Workers>,
    failures: Arc<Failures>,
    next_id: AtomicU64,
}

impl BatchQueue {
    pub fn new(client: RemoteClient, settings: BatchSettings, retry: RetryPolicy) -> Self {
        Self {
            client,
            settings,
            retry,
            workers: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Queue one document; waits while the key's queue is full.
    pub async fn enqueue(&self, key: &QueueKey, mut document: Value) -> Result<()> {
        loop {
            let sender = {
                let mut workers = self.workers.lock().await;
                if workers.get(key).is_some_and(|w| w.sender.is_closed()) {
                    workers.remove(key);
                }
                match workers.get(key) {
                    Some(worker) => worker.sender.clone(),
                    None => {
                        let worker = self.spawn(key.clone());
                        let sender = worker.sender.clone();
                        workers.insert(key.clone(), worker);
                        sender
                    }
                }
            };
            match sender.send(document).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    debug!(
                        index = %key.index,
                        label = %key.node_label,
                        "worker retired, re-enqueueing"
                    );
                    document = returned;
                }
            }
        }
    }

    fn spawn(&self, key: QueueKey) -> Worker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.settings.capacity);
        let drain = Arc::new(Drain::default());
        let task = FlushTask {
            id,
            key: key.clone(),
            client: self.client.clone(),
            settings: self.settings,
            retry: self.retry,
            workers: self.workers.clone(),
            failures: self.failures.clone(),
            drain: drain.clone(),
        };
        debug!(index = %key.index, label = %key.node_label, worker = id, "flush worker started");
        Worker { id, sender, drain, handle: tokio::spawn(task.run(receiver)) }
    }

    /// Send everything queued for `index` now and wait for it. Bulk failures
    /// for the index since the last flush are returned here, including those
    /// of workers that already retired on their own.
    pub async fn flush(&self, index: &str) -> Result<()> {
        let retiring: Vec<Worker> = {
            let mut workers = self.workers.lock().await;
            let keys: Vec<QueueKey> =
                workers.keys().filter(|k| k.index == index).cloned().collect();
            keys.into_iter().filter_map(|k| workers.remove(&k)).collect()
        };
        let joined = Self::drain_all(retiring).await;
        let recorded = {
            let mut failures = self.failures.lock().await;
            let keys: Vec<QueueKey> =
                failures.keys().filter(|k| k.index == index).cloned().collect();
            let drained: Vec<Error> = keys.iter().filter_map(|k| failures.remove(k)).collect();
            drained.into_iter().next()
        };
        match recorded {
            Some(err) => Err(err),
            None => joined,
        }
    }

    /// Drain every queue and stop every worker.
    pub async fn close(&self) -> Result<()> {
        let retiring: Vec<Worker> = self.workers.lock().await.drain().map(|(_, w)| w).collect();
        let joined = Self::drain_all(retiring).await;
        let recorded = self.failures.lock().await.drain().map(|(_, err)| err).next();
        match recorded {
            Some(err) => Err(err),
            None => joined,
        }
    }

    async fn drain_all(retiring: Vec<Worker>) -> Result<()> {
        let mut first_error = None;
        for worker in retiring {
            worker.drain.requested.store(true, Ordering::SeqCst);
            worker.drain.notify.notify_one();
            drop(worker.sender);
            if let Err(join) = worker.handle.await {
                first_error.get_or_insert(Error::Operation(format!(
                    "flush worker {} failed: {join}",
                    worker.id
                )));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Keys that currently have a live worker.
    pub async fn active_keys(&self) -> Vec<QueueKey> {
        let workers = self.workers.lock().await;
        let mut keys: Vec<QueueKey> = workers
            .iter()
            .filter(|(_, w)| !w.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

struct FlushTask {
    id: u64,
    key: QueueKey,
    client: RemoteClient,
    settings: BatchSettings,
    retry: RetryPolicy,
    workers: Arc<Workers>,
    failures: Arc<Failures>,
    drain: Arc<Drain>,
}

impl FlushTask {
    async fn run(self, mut receiver: mpsc::Receiver<Value>) {
        loop {
            if !self.drain.requested.load(Ordering::SeqCst) {
                tokio::select! {
                    () = tokio::time::sleep(self.settings.flush_interval) => {}
                    () = self.drain.notify.notified() => {}
                }
            }

            let mut batch = Vec::with_capacity(self.settings.batch_size);
            while batch.len() < self.settings.batch_size {
                match receiver.try_recv() {
                    Ok(doc) => batch.push(doc),
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                // Under the lock a writer sees either no worker or a closed channel.
                let leftovers = {
                    let mut workers = self.workers.lock().await;
                    receiver.close();
                    if workers.get(&self.key).is_some_and(|w| w.id == self.id) {
                        workers.remove(&self.key);
                    }
                    let mut rest = Vec::new();
                    while let Ok(doc) = receiver.try_recv() {
                        rest.push(doc);
                    }
                    rest
                };
                for chunk in leftovers.chunks(self.settings.batch_size) {
                    self.send(chunk).await;
                }
                debug!(
                    index = %self.key.index,
                    label = %self.key.node_label,
                    worker = self.id,
                    "flush worker exited"
                );
                return;
            }

            self.send(&batch).await;
        }
    }

    async fn send(&self, batch: &[Value]) {
        let client = &self.client;
        let index = self.key.index.as_str();
        let result = self.retry.run("flush", move || client.index_documents(index, batch)).await;
        match result {
            Ok(()) => {
                debug!(index, label = %self.key.node_label, count = batch.len(), "batch flushed");
            }
            Err(err) => {
                if self.drain.requested.load(Ordering::SeqCst) {
                    warn!(index, count = batch.len(), error = %err, "flush failed while draining");
                } else {
                    error!(index, count = batch.len(), error = %err, "batch dropped after retries");
                }
                self.failures.lock().await.entry(self.key.clone()).or_insert(err);
            }
        }
    }
}
