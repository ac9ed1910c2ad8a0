//! The coordinator: wires the event bus, transformer engine, queue, lock
//! manager, circuit breaker and injection router together and drives the
//! worker pool.
//!
//! All external interaction happens through events. `completion:submit`
//! admits work; workers pull conversation-eligible requests, hold the
//! conversation lock for the duration of the provider call, and publish
//! `completion:result` / `completion:error` when done. Terminal results feed
//! the injection router, which may queue follow-up requests on the same
//! chain.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::completion::breaker::{ChainLimits, CircuitBreaker};
use crate::completion::injection::InjectionRouter;
use crate::completion::lock::{ConversationLockManager, LockOutcome};
use crate::completion::queue::CompletionQueue;
use crate::completion::request::{CompletionOutcome, CompletionRequest};
use crate::config::SystemConfig;
use crate::event::event_bus::{
    Event, EventBus, EventError, HandlerPriority, HandlerResult, Value,
};
use crate::event::names;
use crate::event::transformer::{TransformerEngine, TransformerRule};
use crate::provider::{CompletionProvider, ProviderError};
use crate::{Error, InternalResult};

pub struct System {
    config: SystemConfig,
    event_bus: Arc<EventBus>,
    transformers: Arc<TransformerEngine>,
    queue: Arc<CompletionQueue>,
    locks: Arc<ConversationLockManager>,
    breaker: Arc<CircuitBreaker>,
    injection: Arc<InjectionRouter>,
    provider: Arc<dyn CompletionProvider>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl System {
    pub fn new(config: SystemConfig, provider: Arc<dyn CompletionProvider>) -> Arc<Self> {
        let transformers = Arc::new(TransformerEngine::new());
        let event_bus = Arc::new(EventBus::with_transformers(transformers.clone()));
        let default_limits = ChainLimits {
            max_depth: config.breaker.max_depth,
            token_budget: config.breaker.token_budget,
            time_window: config.breaker.time_window,
        };
        let breaker = Arc::new(CircuitBreaker::new(default_limits));
        let queue = Arc::new(CompletionQueue::new(config.queue_capacity, breaker.clone()));
        let locks = Arc::new(ConversationLockManager::new(
            event_bus.clone(),
            config.lock_ttl,
        ));
        let injection = Arc::new(InjectionRouter::new(
            queue.clone(),
            breaker.clone(),
            event_bus.clone(),
            default_limits,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            event_bus,
            transformers,
            queue,
            locks,
            breaker,
            injection,
            provider,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn transformers(&self) -> Arc<TransformerEngine> {
        self.transformers.clone()
    }

    pub fn queue(&self) -> Arc<CompletionQueue> {
        self.queue.clone()
    }

    pub fn locks(&self) -> Arc<ConversationLockManager> {
        self.locks.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Registers the coordination handlers and spawns the worker pool.
    pub fn start(self: Arc<Self>) {
        Self::register_handlers(&self);
        let mut workers = self.workers.lock().expect("worker table poisoned");
        for index in 0..self.config.worker_concurrency {
            workers.push(Self::spawn_worker(&self, index));
        }
        info!(
            workers = self.config.worker_concurrency,
            queue_capacity = self.config.queue_capacity,
            "system started"
        );
    }

    pub async fn shutdown(&self) -> InternalResult<()> {
        self.shutdown_tx
            .send(())
            .map_err(|e| Error::internal(format!("Failed to send shutdown signal: {}", e)))?;
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker table poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker terminated abnormally");
            }
        }
        info!("system stopped");
        Ok(())
    }

    /// Emits an event on the bus. The bus applies the transformer engine to
    /// every emission (this one and the components' internal publications
    /// alike), so registered rules see the full surface.
    pub async fn emit(&self, event: Event) -> Vec<HandlerResult> {
        self.event_bus.emit(event).await
    }

    fn register_handlers(this: &Arc<Self>) {
        let system = Arc::clone(this);
        this.event_bus.register(
            names::COMPLETION_SUBMIT,
            HandlerPriority::Normal,
            None,
            Arc::new(move |event| {
                let system = system.clone();
                Box::pin(async move { system.handle_submit(event).await })
            }),
        );

        let system = Arc::clone(this);
        this.event_bus.register(
            names::COMPLETION_CANCEL,
            HandlerPriority::Normal,
            None,
            Arc::new(move |event| {
                let system = system.clone();
                Box::pin(async move { system.handle_cancel(event).await })
            }),
        );

        let system = Arc::clone(this);
        this.event_bus.register(
            names::COMPLETION_QUEUE_STATUS,
            HandlerPriority::Normal,
            None,
            Arc::new(move |_event| {
                let system = system.clone();
                Box::pin(async move {
                    let status = system.queue.status();
                    let locked = system
                        .locks
                        .locked_conversations()
                        .into_iter()
                        .map(Value::from)
                        .collect::<Vec<_>>();
                    let mut map = std::collections::HashMap::new();
                    map.insert("queued".to_string(), Value::from(status.queued));
                    map.insert("active".to_string(), Value::from(status.active));
                    map.insert("locked_conversations".to_string(), Value::from(locked));
                    Ok(Value::Map(map))
                })
            }),
        );

        let system = Arc::clone(this);
        this.event_bus.register(
            names::CONVERSATION_LOCK_STATUS,
            HandlerPriority::Normal,
            None,
            Arc::new(move |event| {
                let system = system.clone();
                Box::pin(async move {
                    let conversation_id = event.get_str("conversation_id").ok_or_else(|| {
                        EventError::InvalidPayload {
                            message: "conversation_id is required".to_string(),
                        }
                    })?;
                    let status = system.locks.status(conversation_id);
                    let mut map = std::collections::HashMap::new();
                    map.insert(
                        "locked".to_string(),
                        Value::from(status.holder.is_some()),
                    );
                    if let Some(holder) = &status.holder {
                        map.insert(
                            "holder_request_id".to_string(),
                            Value::from(holder.holder_request_id.as_str()),
                        );
                    }
                    let waiters = status
                        .waiters
                        .iter()
                        .map(|w| Value::from(w.as_str()))
                        .collect::<Vec<_>>();
                    map.insert("waiters".to_string(), Value::from(waiters));
                    let forks = status
                        .forks
                        .iter()
                        .map(|fork| {
                            let mut entry = std::collections::HashMap::new();
                            entry.insert(
                                "claimant_request_id".to_string(),
                                Value::from(fork.claimant_request_id.as_str()),
                            );
                            entry.insert(
                                "holder_request_id".to_string(),
                                Value::from(fork.holder_request_id.as_str()),
                            );
                            entry.insert(
                                "detected_at".to_string(),
                                Value::from(fork.detected_at.to_rfc3339()),
                            );
                            entry.insert("reclaimed".to_string(), Value::from(fork.reclaimed));
                            Value::Map(entry)
                        })
                        .collect::<Vec<_>>();
                    map.insert("forks".to_string(), Value::from(forks));
                    Ok(Value::Map(map))
                })
            }),
        );

        let system = Arc::clone(this);
        this.event_bus.register(
            names::ROUTER_REGISTER_TRANSFORMER,
            HandlerPriority::Normal,
            None,
            Arc::new(move |event| {
                let system = system.clone();
                Box::pin(async move {
                    let rule = TransformerRule::from_payload(&event.payload)?;
                    system.transformers.register(rule);
                    Ok(Value::Null)
                })
            }),
        );
    }

    async fn handle_submit(&self, event: Event) -> Result<Value, EventError> {
        let request = match CompletionRequest::from_submit_event(&event) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "rejecting malformed submission");
                self.emit(
                    Event::new(names::COMPLETION_REJECTED)
                        .with("reason", "invalid_payload")
                        .with("detail", e.to_string())
                        .with_context(event.context.clone()),
                )
                .await;
                return Err(e);
            }
        };

        let context = request.event_context("system", &event.context.correlation_id);
        match self.queue.submit(request) {
            Ok(request_id) => {
                self.emit(
                    Event::new(names::COMPLETION_QUEUED)
                        .with("request_id", request_id.as_str())
                        .with_context(context),
                )
                .await;
                Ok(Value::from(request_id))
            }
            Err(e) => {
                warn!(error = %e, "submission rejected");
                self.emit(
                    Event::new(names::COMPLETION_REJECTED)
                        .with("request_id", context.request_id.as_str())
                        .with("reason", e.reason())
                        .with("detail", e.to_string())
                        .with_context(context),
                )
                .await;
                Err(EventError::HandlerFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    async fn handle_cancel(&self, event: Event) -> Result<Value, EventError> {
        let request_id = event
            .get_str("request_id")
            .ok_or_else(|| EventError::InvalidPayload {
                message: "request_id is required".to_string(),
            })?;
        self.queue
            .cancel(request_id)
            .map_err(|e| EventError::HandlerFailed {
                message: e.to_string(),
            })?;
        Ok(Value::Null)
    }

    fn spawn_worker(this: &Arc<Self>, index: usize) -> JoinHandle<()> {
        let system = Arc::clone(this);
        let mut shutdown = this.shutdown_tx.subscribe();
        tokio::spawn(async move {
            debug!(worker = index, "worker started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(worker = index, "worker shutting down");
                        break;
                    }
                    dispatched = system.queue.next() => {
                        let (request, cancel_rx) = dispatched;
                        system.process(request, cancel_rx).await;
                    }
                }
            }
        })
    }

    /// Runs one dispatched request to a terminal state: lock, provider call
    /// with retry, result publication, injection routing, release.
    async fn process(&self, request: CompletionRequest, cancel_rx: watch::Receiver<bool>) {
        let context = request.event_context("system", &Uuid::new_v4().to_string());

        // The queue already serializes per conversation, so contention here
        // comes from lock holders outside this queue's view (stale or
        // external). Park and retry until the claim is granted; after
        // `lock_wait_timeout` a single informational notification is
        // published and the claim keeps waiting.
        let wait_started = std::time::Instant::now();
        let mut timeout_reported = false;
        loop {
            let outcome = self
                .locks
                .acquire(
                    &request.conversation_id,
                    &request.request_id,
                    &request.chain_id,
                    Some(self.config.lock_ttl),
                )
                .await;
            match outcome {
                LockOutcome::Acquired(_) => break,
                _ => {
                    if *cancel_rx.borrow() {
                        self.finish_cancelled(&request, &context).await;
                        return;
                    }
                    if !timeout_reported && wait_started.elapsed() >= self.config.lock_wait_timeout
                    {
                        timeout_reported = true;
                        warn!(
                            request_id = %request.request_id,
                            conversation_id = %request.conversation_id,
                            waited_ms = wait_started.elapsed().as_millis() as u64,
                            "lock wait exceeded the configured timeout"
                        );
                        self.emit(
                            Event::new(names::COMPLETION_LOCK_TIMEOUT)
                                .with("request_id", request.request_id.as_str())
                                .with("conversation_id", request.conversation_id.as_str())
                                .with("waited_ms", wait_started.elapsed().as_millis() as u64)
                                .with_context(context.clone()),
                        )
                        .await;
                    }
                    tokio::time::sleep(self.config.lock_retry_interval).await;
                }
            }
        }

        self.emit(
            Event::new(names::COMPLETION_DISPATCHED)
                .with("request_id", request.request_id.as_str())
                .with("conversation_id", request.conversation_id.as_str())
                .with_context(context.clone()),
        )
        .await;

        let outcome = self.call_provider(&request, &cancel_rx).await;

        let Some(outcome) = outcome else {
            self.finish_cancelled(&request, &context).await;
            return;
        };

        // A chained request pins its budget before any usage is recorded.
        if let Some(config) = &request.injection_config {
            self.breaker.register_chain(
                &request.chain_id,
                ChainLimits::from_config(
                    config,
                    ChainLimits {
                        max_depth: self.config.breaker.max_depth,
                        token_budget: self.config.breaker.token_budget,
                        time_window: self.config.breaker.time_window,
                    },
                ),
            );
        }
        if let CompletionOutcome::Result { usage, .. } = &outcome {
            self.breaker.record_usage(&request.chain_id, usage.total());
        }

        match &outcome {
            CompletionOutcome::Result { output, .. } => {
                let mut event = Event::new(names::COMPLETION_RESULT)
                    .with("request_id", request.request_id.as_str())
                    .with("conversation_id", request.conversation_id.as_str())
                    .with("output", output.as_str())
                    .with_context(context.clone());
                event
                    .payload
                    .insert("usage".to_string(), Value::Map(outcome.usage_payload()));
                self.emit(event).await;
            }
            CompletionOutcome::Error { kind, retryable } => {
                error!(
                    request_id = %request.request_id,
                    kind = %kind,
                    "completion failed"
                );
                self.emit(
                    Event::new(names::COMPLETION_ERROR)
                        .with("request_id", request.request_id.as_str())
                        .with("conversation_id", request.conversation_id.as_str())
                        .with("kind", kind.as_str())
                        .with("retryable", *retryable)
                        .with_context(context.clone()),
                )
                .await;
            }
        }

        self.injection.on_result(&request, &outcome).await;
        self.locks.release(&request.conversation_id, &request.request_id);
        self.queue.complete(&request);
    }

    /// Provider call with exponential backoff on retryable failures.
    /// `None` means the request was cancelled mid-flight.
    async fn call_provider(
        &self,
        request: &CompletionRequest,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Option<CompletionOutcome> {
        let mut attempt = 0;
        let mut backoff = self.config.retry.initial_backoff;
        loop {
            attempt += 1;
            match self
                .provider
                .complete(request.clone(), cancel_rx.clone())
                .await
            {
                Ok(response) => {
                    return Some(CompletionOutcome::Result {
                        output: response.output,
                        usage: response.usage,
                    });
                }
                Err(ProviderError::Cancelled) => return None,
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_attempts => {
                    warn!(
                        request_id = %request.request_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    if *cancel_rx.borrow() {
                        return None;
                    }
                }
                Err(e) => {
                    return Some(CompletionOutcome::Error {
                        kind: e.kind().to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
    }

    async fn finish_cancelled(
        &self,
        request: &CompletionRequest,
        context: &crate::event::event_bus::EventContext,
    ) {
        info!(request_id = %request.request_id, "completion cancelled");
        // A cancelled hop never counts against its chain, even when the
        // cancel landed after dispatch.
        if request.is_injected() {
            self.breaker.release_admission(&request.chain_id);
        }
        self.locks
            .release(&request.conversation_id, &request.request_id);
        self.emit(
            Event::new(names::COMPLETION_CANCELLED)
                .with("request_id", request.request_id.as_str())
                .with("conversation_id", request.conversation_id.as_str())
                .with_context(context.clone()),
        )
        .await;
        self.queue.complete(request);
    }
}
