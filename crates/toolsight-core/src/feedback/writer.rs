//! Single-writer feedback task
//!
//! All feedback writes funnel through one task consuming an unbounded queue,
//! so SQLite sees exactly one writer and callers on the hot path never block
//! on disk. Appends from the aggregator are fire-and-forget (a crash may lose
//! the in-flight tail); the trainer requests acknowledged writes where
//! correctness demands durability.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{Error, Result};

use super::{FeedbackStore, NewAnnotation, NewBackupRecord, NewExample, NewSessionRecord};

// ============================================================================
// COMMANDS
// ============================================================================

enum WriteKind {
    Example(NewExample),
    Annotation(NewAnnotation),
    Session(NewSessionRecord),
    Backup(NewBackupRecord),
    MarkConsumed { ids: Vec<i64>, session_id: i64 },
    Approve { id: i64, admin_id: i64 },
}

struct WriteOp {
    kind: WriteKind,
    ack: Option<oneshot::Sender<Result<i64>>>,
}

// ============================================================================
// WRITER
// ============================================================================

/// Handle for submitting writes to the feedback writer task
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteOp>,
}

/// The writer task itself; owns the store for the lifetime of the service
pub struct FeedbackWriter {
    handle: WriterHandle,
    task: tokio::task::JoinHandle<()>,
}

impl FeedbackWriter {
    /// Spawn the writer task over a store
    pub fn spawn(store: Arc<FeedbackStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = Self::execute(&store, op.kind);
                if let Err(e) = &result {
                    error!(error = %e, "feedback write failed");
                }
                if let Some(ack) = op.ack {
                    // Receiver may have given up waiting; that is fine.
                    let _ = ack.send(result);
                }
            }
            debug!("feedback writer drained and stopped");
        });
        Self {
            handle: WriterHandle { tx },
            task,
        }
    }

    fn execute(store: &FeedbackStore, kind: WriteKind) -> Result<i64> {
        match kind {
            WriteKind::Example(example) => store.add_example(&example),
            WriteKind::Annotation(annotation) => store.add_new_product(&annotation),
            WriteKind::Session(record) => store.log_training_session(&record),
            WriteKind::Backup(record) => store.log_model_backup(&record),
            WriteKind::MarkConsumed { ids, session_id } => {
                store.mark_consumed(&ids, session_id).map(|n| n as i64)
            }
            WriteKind::Approve { id, admin_id } => {
                store.approve_new_product(id, admin_id).map(|_| id)
            }
        }
    }

    /// Submission handle; cheap to clone into the aggregator and trainer
    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Abort the task (tests and shutdown paths)
    pub fn shutdown(self) {
        drop(self.handle);
        self.task.abort();
    }
}

impl WriterHandle {
    fn submit(&self, kind: WriteKind, ack: Option<oneshot::Sender<Result<i64>>>) -> Result<()> {
        self.tx
            .send(WriteOp { kind, ack })
            .map_err(|_| Error::Internal("feedback writer stopped".into()))
    }

    async fn submit_acked(&self, kind: WriteKind) -> Result<i64> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(kind, Some(ack_tx))?;
        ack_rx
            .await
            .map_err(|_| Error::Internal("feedback writer dropped ack".into()))?
    }

    /// Fire-and-forget append of a labeled example
    pub fn example(&self, example: NewExample) -> Result<()> {
        self.submit(WriteKind::Example(example), None)
    }

    /// Acknowledged append of a labeled example
    pub async fn example_acked(&self, example: NewExample) -> Result<i64> {
        self.submit_acked(WriteKind::Example(example)).await
    }

    /// Fire-and-forget append of a new-product annotation
    pub fn annotation(&self, annotation: NewAnnotation) -> Result<()> {
        self.submit(WriteKind::Annotation(annotation), None)
    }

    /// Durable session write; the returned id is the session id
    pub async fn session(&self, record: NewSessionRecord) -> Result<i64> {
        self.submit_acked(WriteKind::Session(record)).await
    }

    /// Durable backup write
    pub async fn backup(&self, record: NewBackupRecord) -> Result<i64> {
        self.submit_acked(WriteKind::Backup(record)).await
    }

    /// Durable consume-marking
    pub async fn mark_consumed(&self, ids: Vec<i64>, session_id: i64) -> Result<i64> {
        self.submit_acked(WriteKind::MarkConsumed { ids, session_id })
            .await
    }

    /// Durable annotation approval
    pub async fn approve(&self, id: i64, admin_id: i64) -> Result<i64> {
        self.submit_acked(WriteKind::Approve { id, admin_id }).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
