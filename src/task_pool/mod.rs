//! The Task Worker Pool (spec §4.6): offloads blocking/CPU-heavy work off
//! the event-loop path. In the source system these are separate OS
//! processes reachable only through a bus; here they are Tokio tasks bounded
//! by a semaphore sized to `CHANNEL_TASK_WORKER_NUM`, which gives the same
//! "parallel, may block freely, addressed only through submission/
//! correlation" contract without a literal second process pool (tasks that
//! truly block the OS thread, e.g. `std::fs` calls, should use
//! `tokio::task::spawn_blocking` inside their handler — a detail each task
//! handler owns, not the pool).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::{AppError, AppResult};
use crate::fd::Fd;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type TaskHandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type DeliveryFn = Arc<dyn Fn(TaskCompletion) + Send + Sync>;

/// A unit of offloaded work (spec §3 TaskEnvelope). `correlation_id`s must
/// be unique within the process lifetime — `TaskPool` enforces this by
/// rejecting a submission that reuses one still in flight.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub name: String,
    pub payload: Value,
    pub correlation_id: String,
    pub origin_fd: Option<Fd>,
}

/// The result handed back through the completion bus. `outcome` is `Err`
/// for both "no handler registered for this task name" and whatever error
/// string the handler itself produced — both are wrapped into the
/// `api_error` shape on the way out (spec §7: "errors crossing the
/// task-worker boundary are wrapped into a completion envelope with a
/// `status=error` field").
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub correlation_id: String,
    pub origin_fd: Option<Fd>,
    pub outcome: Result<Value, String>,
}

/// Offload pool. Construct once in `main`, `register` task handlers by name,
/// then `set_delivery` to wire completions back to the connection manager
/// before accepting any submissions.
pub struct TaskPool {
    handlers: Arc<DashMap<String, TaskHandlerFn>>,
    semaphore: Arc<Semaphore>,
    delivery: Arc<RwLock<Option<DeliveryFn>>>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl TaskPool {
    pub fn new(worker_num: usize) -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            semaphore: Arc::new(Semaphore::new(worker_num.max(1))),
            delivery: Arc::new(RwLock::new(None)),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Establish the `name → handler` map a task worker would have at
    /// startup (spec §4.6: "the pool dispatches to one of its task workers
    /// by the `name → handler` map established at task-worker start").
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.handlers
            .insert(name.to_string(), Arc::new(move |payload| Box::pin(handler(payload))));
    }

    /// Wire the function that delivers a [`TaskCompletion`] back to its
    /// origin (normally [`crate::websocket::connection_manager::ConnectionManager::deliver_task_completion`]).
    /// A pool with no delivery target just logs and discards completions —
    /// useful in tests that only exercise `submit_and_await`.
    pub fn set_delivery(&self, delivery: DeliveryFn) {
        *self.delivery.write().expect("delivery lock poisoned") = Some(delivery);
    }

    fn claim_correlation_id(&self, correlation_id: &str) -> AppResult<()> {
        if self.in_flight.insert(correlation_id.to_string(), ()).is_some() {
            return Err(AppError::Input(format!(
                "correlation id '{correlation_id}' is already in flight"
            )));
        }
        Ok(())
    }

    /// Fire-and-forget submission (spec §4.6 "Submission"): runs the task on
    /// a bounded background task and delivers the result through whatever
    /// `set_delivery` callback is installed. Used by the WS `api` path,
    /// where the handler returns immediately and the client learns of
    /// completion via a later push.
    pub fn submit(&self, envelope: TaskEnvelope) -> AppResult<()> {
        self.claim_correlation_id(&envelope.correlation_id)?;
        let handlers = self.handlers.clone();
        let semaphore = self.semaphore.clone();
        let delivery = self.delivery.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let handler = handlers.get(&envelope.name).map(|h| h.clone());
            let outcome = match handler {
                Some(h) => h(envelope.payload).await,
                None => Err(format!("no task handler registered for '{}'", envelope.name)),
            };
            in_flight.remove(&envelope.correlation_id);

            let completion = TaskCompletion {
                correlation_id: envelope.correlation_id,
                origin_fd: envelope.origin_fd,
                outcome,
            };
            let target = delivery.read().expect("delivery lock poisoned").clone();
            match target {
                Some(deliver) => deliver(completion),
                None => tracing::debug!(
                    correlation_id = %completion.correlation_id,
                    "task completed with no delivery target registered; discarding"
                ),
            }
        });
        Ok(())
    }

    /// Synchronous offload used by purely-HTTP flows (spec §4.6
    /// "Completion"): "for purely HTTP flows, holds the HTTP response open
    /// ... until the correlated result arrives" — here that's simply
    /// awaiting the task inline, bounded by the same semaphore every WS
    /// offload goes through.
    pub async fn submit_and_await(&self, envelope: TaskEnvelope) -> AppResult<Value> {
        self.claim_correlation_id(&envelope.correlation_id)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AppError::Transport("task pool is shutting down".into()))?;
        let handler = self.handlers.get(&envelope.name).map(|h| h.clone());
        let result = match handler {
            Some(h) => h(envelope.payload).await.map_err(AppError::Handler),
            None => Err(AppError::Input(format!(
                "no task handler registered for '{}'",
                envelope.name
            ))),
        };
        self.in_flight.remove(&envelope.correlation_id);
        result
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
