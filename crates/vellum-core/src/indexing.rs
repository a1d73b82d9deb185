use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use vellum_models::{ConversationId, MessageId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexJob {
    Upsert {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Remove {
        tenant_id: TenantId,
        message_id: MessageId,
    },
}

impl IndexJob {
    /// Job for an event, if the event concerns indexable content.
    /// Confidential messages never produce a job.
    pub fn from_event(event: &CoreEvent) -> Option<Self> {
        match *event {
            CoreEvent::MessageSent {
                tenant_id,
                conversation_id,
                message_id,
                is_confidential: false,
                ..
            }
            | CoreEvent::MessageEdited {
                tenant_id,
                conversation_id,
                message_id,
                is_confidential: false,
                ..
            } => Some(Self::Upsert {
                tenant_id,
                conversation_id,
                message_id,
            }),
            CoreEvent::MessageDeleted {
                tenant_id,
                message_id,
                is_confidential: false,
                ..
            } => Some(Self::Remove {
                tenant_id,
                message_id,
            }),
            _ => None,
        }
    }
}

/// Downstream search pipeline.
pub trait SearchIndexer: Send + Sync {
    fn index<'a>(&'a self, job: &'a IndexJob) -> BoxFuture<'a, Result<(), CoreError>>;
}

/// Default indexer: records the job and does nothing else.
pub struct LoggingIndexer;

impl SearchIndexer for LoggingIndexer {
    fn index<'a>(&'a self, job: &'a IndexJob) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            tracing::debug!(?job, "index job");
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexRun {
    pub indexed: usize,
    pub failed: usize,
}

/// Bounded queue between the event bus and the indexing hook. When full
/// the oldest job is dropped.
pub struct IndexingQueue {
    jobs: Mutex<VecDeque<IndexJob>>,
    capacity: usize,
}

impl IndexingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, job: IndexJob) {
        let Ok(mut jobs) = self.jobs.lock() else {
            return;
        };
        if jobs.len() >= self.capacity {
            jobs.pop_front();
            tracing::warn!(capacity = self.capacity, "indexing queue full, dropped oldest job");
        }
        jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, max: usize) -> Vec<IndexJob> {
        match self.jobs.lock() {
            Ok(mut jobs) => {
                let n = max.min(jobs.len());
                jobs.drain(..n).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Feed the queue from the bus until the bus closes.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let queue = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(job) = IndexJob::from_event(&event) {
                            queue.push(job);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "indexing queue lagged behind event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Scheduler callback: hand up to `max_jobs` queued jobs to the indexer.
    /// Failed jobs are logged and dropped.
    pub async fn run_indexing_hook(&self, indexer: &dyn SearchIndexer, max_jobs: usize) -> IndexRun {
        let mut run = IndexRun::default();
        for job in self.take(max_jobs) {
            match indexer.index(&job).await {
                Ok(()) => run.indexed += 1,
                Err(err) => {
                    run.failed += 1;
                    tracing::warn!(?job, error = %err, "index job failed");
                }
            }
        }
        run
    }
}
