//! Processing queue between intake and ingestion.
//!
//! Any number of [`QueueHandle`]s enqueue document ids without blocking;
//! a single [`ProcessingQueue`] consumer processes them in FIFO order.
//! A failed document is logged and counted and the loop moves on; retrying
//! means enqueueing the id again.
//!
//! Shutdown is cooperative. After [`CancellationToken::cancel`] the
//! consumer takes no new ids, but a document already being processed runs
//! to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info};

use crate::error::{Error, Result, Service};
use crate::ingest::Orchestrator;

/// Cooperative cancellation token that can also be awaited.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Whatever the consumer hands each id to.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(&self, document_id: &str) -> Result<()>;
}

#[async_trait]
impl DocumentProcessor for Orchestrator {
    async fn process(&self, document_id: &str) -> Result<()> {
        self.process_document(document_id).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    pub failed: usize,
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl QueueHandle {
    /// Never blocks. Fails only once the consumer has stopped.
    pub fn enqueue(&self, document_id: impl Into<String>) -> Result<()> {
        let id = document_id.into();
        self.tx.send(id).map_err(|e| {
            Error::external(
                Service::Queue,
                format!("consumer has stopped; dropped document {}", e.0),
            )
        })
    }
}

/// Consumer side.
pub struct ProcessingQueue {
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn channel() -> (QueueHandle, ProcessingQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueHandle { tx }, ProcessingQueue { rx })
}

impl ProcessingQueue {
    /// Process ids until cancelled or until every handle is dropped and
    /// the queue is drained.
    pub async fn run<P>(mut self, processor: &P, token: CancellationToken) -> QueueReport
    where
        P: DocumentProcessor + ?Sized,
    {
        let mut report = QueueReport::default();
        info!("processing queue started");

        loop {
            if token.is_cancelled() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                id = self.rx.recv() => id,
            };
            let Some(id) = next else {
                break;
            };

            match processor.process(&id).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(document_id = %id, error = %e, "document processing failed");
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            "processing queue stopped"
        );
        report
    }
}
