//! Step bridge - 実行プールとストアをつなぐ要求/応答チャネル
//!
//! Handler code on the execution pool never holds a store handle. Every step
//! read or write goes through a [`StepClient`] as a request with a
//! correlation id; a [`StepBroker`] on the orchestration runtime performs it
//! and answers. Each call is bounded by a timeout, and dropping the broker
//! fails every call still waiting for an answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::domain::{ErrorInfo, Step, StepId, StoreError, TaskId};
use crate::ports::StepStore;

/// Requests are buffered up to this many before `call` waits.
const REQUEST_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum StepRequest {
    Find {
        task_id: TaskId,
        step_key: String,
    },
    CreateOrFind {
        task_id: TaskId,
        step_key: String,
        input: Option<serde_json::Value>,
    },
    Complete {
        step_id: StepId,
        output: serde_json::Value,
        compensation_fn: Option<String>,
    },
    Fail {
        step_id: StepId,
        error: ErrorInfo,
    },
    IncrementAttempt {
        step_id: StepId,
    },
}

impl StepRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            StepRequest::Find { .. } => "find_step",
            StepRequest::CreateOrFind { .. } => "create_or_find_step",
            StepRequest::Complete { .. } => "complete_step",
            StepRequest::Fail { .. } => "fail_step",
            StepRequest::IncrementAttempt { .. } => "increment_attempt",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepReply {
    Step(Option<Step>),
    Ack,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("step channel closed")]
    Closed,

    #[error("store error: {0}")]
    Store(String),

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        BridgeError::Store(e.to_string())
    }
}

struct Envelope {
    correlation_id: u64,
    request: StepRequest,
    reply: oneshot::Sender<Result<StepReply, BridgeError>>,
}

/// A client/broker pair with the given per-call timeout.
pub fn channel(task_id: TaskId, timeout: Duration) -> (StepClient, StepBroker) {
    let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
    let client = StepClient {
        inner: Arc::new(ClientInner {
            task_id,
            tx,
            timeout,
            next_id: AtomicU64::new(1),
        }),
    };
    (client, StepBroker { rx })
}

struct ClientInner {
    task_id: TaskId,
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
    next_id: AtomicU64,
}

/// Handler-side end. Cheap to clone.
#[derive(Clone)]
pub struct StepClient {
    inner: Arc<ClientInner>,
}

impl StepClient {
    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub async fn call(&self, request: StepRequest) -> Result<StepReply, BridgeError> {
        let operation = request.operation();
        let correlation_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            correlation_id,
            request,
            reply: reply_tx,
        };

        let exchange = async {
            self.inner
                .tx
                .send(envelope)
                .await
                .map_err(|_| BridgeError::Closed)?;
            reply_rx.await.map_err(|_| BridgeError::Closed)?
        };
        match tokio::time::timeout(self.inner.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                operation,
                after: self.inner.timeout,
            }),
        }
    }

    pub async fn find(&self, step_key: &str) -> Result<Option<Step>, BridgeError> {
        let reply = self
            .call(StepRequest::Find {
                task_id: self.task_id(),
                step_key: step_key.to_string(),
            })
            .await?;
        match reply {
            StepReply::Step(step) => Ok(step),
            StepReply::Ack => Err(BridgeError::UnexpectedReply("find_step")),
        }
    }

    pub async fn create_or_find(
        &self,
        step_key: &str,
        input: Option<serde_json::Value>,
    ) -> Result<Step, BridgeError> {
        let reply = self
            .call(StepRequest::CreateOrFind {
                task_id: self.task_id(),
                step_key: step_key.to_string(),
                input,
            })
            .await?;
        match reply {
            StepReply::Step(Some(step)) => Ok(step),
            _ => Err(BridgeError::UnexpectedReply("create_or_find_step")),
        }
    }

    pub async fn complete(
        &self,
        step_id: StepId,
        output: serde_json::Value,
        compensation_fn: Option<String>,
    ) -> Result<(), BridgeError> {
        self.call(StepRequest::Complete {
            step_id,
            output,
            compensation_fn,
        })
        .await
        .map(drop)
    }

    pub async fn fail(&self, step_id: StepId, error: ErrorInfo) -> Result<(), BridgeError> {
        self.call(StepRequest::Fail { step_id, error }).await.map(drop)
    }

    pub async fn increment_attempt(&self, step_id: StepId) -> Result<(), BridgeError> {
        self.call(StepRequest::IncrementAttempt { step_id })
            .await
            .map(drop)
    }
}

/// Store-side end. Runs on the orchestration runtime.
pub struct StepBroker {
    rx: mpsc::Receiver<Envelope>,
}

impl StepBroker {
    /// Answer requests until every client is dropped.
    pub async fn serve(mut self, store: Arc<dyn StepStore>) {
        while let Some(envelope) = self.rx.recv().await {
            let store = store.clone();
            tokio::spawn(async move {
                let Envelope {
                    correlation_id,
                    request,
                    reply,
                } = envelope;
                let operation = request.operation();
                trace!(correlation_id, operation, "step request");
                let result = handle(store.as_ref(), request).await;
                if reply.send(result).is_err() {
                    debug!(correlation_id, operation, "caller gave up before the reply");
                }
            });
        }
    }
}

async fn handle(store: &dyn StepStore, request: StepRequest) -> Result<StepReply, BridgeError> {
    Ok(match request {
        StepRequest::Find { task_id, step_key } => {
            StepReply::Step(store.find_by_task_and_key(task_id, &step_key).await?)
        }
        StepRequest::CreateOrFind {
            task_id,
            step_key,
            input,
        } => StepReply::Step(Some(store.create_or_find(task_id, &step_key, input).await?)),
        StepRequest::Complete {
            step_id,
            output,
            compensation_fn,
        } => {
            store.update_completed(step_id, output, compensation_fn).await?;
            StepReply::Ack
        }
        StepRequest::Fail { step_id, error } => {
            store.update_failed(step_id, &error).await?;
            StepReply::Ack
        }
        StepRequest::IncrementAttempt { step_id } => {
            store.increment_attempt(step_id).await?;
            StepReply::Ack
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepStatus;
    use crate::impls::InMemoryStore;
    use serde_json::json;

    fn serve(timeout: Duration) -> (StepClient, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let (client, broker) = channel(TaskId::generate(), timeout);
        tokio::spawn(broker.serve(store.clone()));
        (client, store)
    }

    #[tokio::test]
    async fn requests_reach_the_store() {
        let (client, store) = serve(Duration::from_secs(5));
        assert_eq!(client.find("charge").await.unwrap(), None);

        let step = client.create_or_find("charge", None).await.unwrap();
        client.complete(step.id, json!(42), Some("wf:charge".into())).await.unwrap();

        let stored = client.find("charge").await.unwrap().unwrap();
        assert_eq!(stored.status, StepStatus::Completed);
        assert_eq!(stored.output, Some(json!(42)));
        assert_eq!(
            store.find_by_task_and_key(client.task_id(), "charge").await.unwrap().unwrap().id,
            step.id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_calls_time_out() {
        // broker never served
        let (client, _broker) = channel(TaskId::generate(), Duration::from_millis(200));
        let err = client.find("charge").await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { operation: "find_step", .. }));
    }

    #[tokio::test]
    async fn dropped_broker_fails_calls() {
        let (client, broker) = channel(TaskId::generate(), Duration::from_secs(5));
        drop(broker);
        assert!(matches!(client.find("charge").await, Err(BridgeError::Closed)));
    }
}
