//! The engine (C9): owns one instance of every component and runs the
//! single cooperative event loop, grounded on the deleted (internalized)
//! `DeliveryProcessor::init`/`serve`'s `tokio::select!` shape.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use empath_common::{internal, Signal};
use empath_tracing::traced;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::{
    active_set::{admit_one_round, ActiveSetController},
    concurrency::ConcurrencyController,
    config::EngineConfig,
    dispatcher::{DeliveryAgent, DispatchRecipient, DispatchRequest, Dispatcher, TransportStatus},
    entity::EntityStore,
    error::QmgrError,
    loader::{LoadedRecipient, MessageLoader, RawRecipient, Resolver},
    message::{Message, MessageId},
    metrics::QmgrMetrics,
    retry::{left_over_stamp, Reporter, RetryEngine},
    scanner::{QueueScanner, QueueSource, ScanFlags},
    scheduler::Scheduler,
    service::{DestinationSnapshot, EngineQueryService},
    trigger::Trigger,
};

/// Everything the engine needs from the outside world, collected in one
/// place rather than threaded through as separate globals.
pub struct EngineDeps {
    pub incoming: Box<dyn QueueSource>,
    pub deferred: Box<dyn QueueSource>,
    pub resolver: Arc<dyn Resolver>,
    pub agent: Arc<dyn DeliveryAgent>,
    pub reporter: Arc<dyn Reporter>,
}

/// The queue manager engine: single mutator of all scheduling state, with
/// no lock needed and no concurrent mutator even though it runs on a
/// multi-threaded `tokio` runtime — all engine-mutating work happens
/// inside `serve`'s own task.
pub struct Engine {
    config: EngineConfig,
    store: EntityStore,
    scheduler: Scheduler,
    concurrency: ConcurrencyController,
    active_set: Mutex<ActiveSetController>,
    incoming_scanner: Mutex<QueueScanner>,
    deferred_scanner: Mutex<QueueScanner>,
    resolver: Arc<dyn Resolver>,
    agent: Arc<dyn DeliveryAgent>,
    reporter: Arc<dyn Reporter>,
    messages: DashMap<MessageId, Message>,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    trigger_rx: Mutex<mpsc::UnboundedReceiver<Trigger>>,
    active_count: AtomicUsize,
    shutting_down: AtomicBool,
    metrics: QmgrMetrics,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Self {
            active_set: Mutex::new(ActiveSetController::new(config.active_limit)),
            incoming_scanner: Mutex::new(QueueScanner::new("incoming", deps.incoming)),
            deferred_scanner: Mutex::new(QueueScanner::new("deferred", deps.deferred)),
            concurrency: ConcurrencyController::new(config.dead_cache_capacity),
            config,
            store: EntityStore::new(),
            scheduler: Scheduler::new(),
            resolver: deps.resolver,
            agent: deps.agent,
            reporter: deps.reporter,
            messages: DashMap::new(),
            trigger_tx,
            trigger_rx: Mutex::new(trigger_rx),
            active_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            metrics: QmgrMetrics::new(),
        }
    }

    /// Startup left-over handling: files the caller finds still sitting
    /// in the active queue are handed back here so they can be
    /// re-admitted via the incoming scanner with a delayed stamp.
    #[must_use]
    pub fn left_over_admission_time(&self, transport: &str) -> SystemTime {
        left_over_stamp(self.config.retry_policy(transport).min_backoff())
    }

    /// Runs the cooperative event loop until a shutdown signal arrives.
    ///
    /// # Errors
    /// Propagates fatal errors from any collaborator it drives.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self, shutdown)), timing(precision = "s"))]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), QmgrError> {
        internal!("starting queue manager engine loop");
        let mut scan_timer = tokio::time::interval(self.config.queue_run_delay());
        scan_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scan_timer.tick() => {
                    self.deferred_scanner.lock().await.request(ScanFlags { scan_all: false, flush_dead: false });
                    self.run_one_turn().await?;
                }
                trigger = async {
                    self.trigger_rx.lock().await.recv().await
                } => {
                    if let Some(trigger) = trigger {
                        self.apply_trigger(trigger).await;
                        self.run_one_turn().await?;
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(_) => {
                            internal!("queue manager engine shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.drain_on_shutdown().await;
        Ok(())
    }

    async fn drain_on_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.active_count.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn apply_trigger(&self, trigger: Trigger) {
        match trigger {
            Trigger::ScanIncoming => {
                self.incoming_scanner.lock().await.request(ScanFlags::default());
            }
            Trigger::ScanDeferred => {
                self.deferred_scanner.lock().await.request(ScanFlags::default());
            }
            Trigger::ScanAll => {
                let flags = ScanFlags { scan_all: true, flush_dead: false };
                self.incoming_scanner.lock().await.request(flags);
                self.deferred_scanner.lock().await.request(flags);
            }
            Trigger::FlushDead => {
                let transports: Vec<_> = (0..self.store.transport_count() as u32)
                    .map(crate::entity::TransportId::from_raw)
                    .collect();
                for t in transports {
                    if let Some(transport) = self.store.transport(t) {
                        self.concurrency.flush_dead(&self.store, &transport.destinations);
                    }
                    if let Some(mut transport) = self.store.transport_mut(t) {
                        transport.dead_until = None;
                    }
                }
            }
        }
    }

    /// One pass of the main-loop callback: drain whatever dispatches are
    /// ready, then admit one incoming and one deferred file, per the
    /// active-set controller's fixed alternation.
    async fn run_one_turn(&self) -> Result<(), QmgrError> {
        self.drain_ready_batches().await?;

        let now = now_unix();
        let mut active_set = self.active_set.lock().await;
        let mut incoming = self.incoming_scanner.lock().await;
        let mut deferred = self.deferred_scanner.lock().await;

        let action = admit_one_round(
            &mut active_set,
            || async {
                match incoming.next(now).await {
                    Ok(Some(path)) => self.admit_file(&path, "incoming").await.is_ok(),
                    _ => false,
                }
            },
            || async {
                match deferred.next(now).await {
                    Ok(Some(path)) => self.admit_file(&path, "deferred").await.is_ok(),
                    _ => false,
                }
            },
        )
        .await;

        self.active_count.store(active_set.in_core(), Ordering::SeqCst);
        let _ = action; // LoopAction only matters to a real timer-driven host loop
        Ok(())
    }

    async fn admit_file(&self, path: &str, source: &str) -> Result<(), QmgrError> {
        let Some(id) = MessageId::from_filename(path) else {
            return Err(QmgrError::Corruption { path: path.to_string(), reason: "bad queue id".into() });
        };
        self.admit_message(id, String::new());
        self.metrics.record_admission(source);
        Ok(())
    }

    /// Admits an already-identified message directly, bypassing the
    /// on-disk queue source. Used by the startup left-over path and by
    /// test harnesses that seed messages without a real `QueueSource`.
    pub fn admit_message(&self, id: MessageId, sender: impl Into<String>) {
        let message = Message::new(id, sender.into());
        self.messages.insert(id, message);
    }

    /// Marks a message as having no more recipient data to load. Whatever
    /// streams recipients in from a queue file calls this once the file
    /// is exhausted; removes the message immediately, freeing its
    /// active-set slot, if every recipient already reached a terminal
    /// state.
    pub async fn finish_loading(&self, message_id: MessageId) {
        let Some(mut msg) = self.messages.get_mut(&message_id) else { return };
        msg.fully_loaded = true;
        let complete = msg.is_complete();
        drop(msg);
        if complete {
            self.messages.remove(&message_id);
            self.active_set.lock().await.release();
            self.metrics.record_release();
        }
    }

    /// Loads one raw recipient for an already-admitted message, binding it
    /// into the entity store and scheduler.
    pub async fn load_recipient(&self, message_id: MessageId, raw: RawRecipient) -> Result<(), QmgrError> {
        let loader = MessageLoader::new(&self.config, &self.store, self.resolver.as_ref());
        let offset = raw.offset;
        let Some(message_ref) = self.messages.get(&message_id) else {
            return Err(QmgrError::Invariant("load_recipient for unknown message".into()));
        };
        let outcome = loader
            .load_recipient(&message_ref, raw)
            .await
            .map_err(|source| QmgrError::Resolver { recipient: message_id.to_string(), source })?;
        drop(message_ref);

        match outcome {
            LoadedRecipient::Bound(entry) => {
                let transport = entry.transport;
                let dest = entry.destination;
                let is_new_job = self.scheduler.upsert_job(transport, message_id, dest, 1);
                if is_new_job {
                    let transport_name = self.transport_name(transport);
                    // push-on-entry applies once, when this message's job
                    // on this transport is first created, not once per
                    // recipient.
                    self.scheduler.push_job(transport, message_id, &self.config.preemption_policy(&transport_name));
                    self.metrics.record_stack_depth(&transport_name, self.scheduler.stack_depth(transport));
                }
                if let Some(mut dest_row) = self.store.destination_mut(dest) {
                    dest_row.pending.push(entry);
                }
                if let Some(mut msg) = self.messages.get_mut(&message_id) {
                    msg.recipients_total += 1;
                }
            }
            LoadedRecipient::Discarded => {
                if let Some(mut msg) = self.messages.get_mut(&message_id) {
                    msg.recipients_terminal += 1;
                }
            }
            LoadedRecipient::Bounced { address, reason } => {
                self.reporter
                    .bounce(&message_id.to_string(), &address, &reason)
                    .await
                    .map_err(QmgrError::Io)?;
                if let Some(mut msg) = self.messages.get_mut(&message_id) {
                    msg.recipients_terminal += 1;
                }
            }
            LoadedRecipient::CapExceeded => {
                // The per-message recipient cap is already met; this raw
                // record was never resolved or bound. Stamp the resume
                // point so whatever streams this message's recipients
                // knows to pick back up here on a later cohort instead of
                // silently dropping the recipient.
                if let Some(mut msg) = self.messages.get_mut(&message_id) {
                    msg.resume_offset = offset;
                }
            }
        }
        Ok(())
    }

    fn transport_name(&self, transport: crate::entity::TransportId) -> String {
        self.store
            .transport(transport)
            .map_or_else(String::new, |t| t.name.clone())
    }

    /// Runs one dispatch pass without waiting for the scan timer or a
    /// trigger; exposed for callers that want fine-grained control over
    /// the loop (test harnesses, `qmgrctl`-style one-shot drains).
    ///
    /// # Errors
    /// Propagates any error a collaborator raises while draining.
    pub async fn drain_once(&self) -> Result<(), QmgrError> {
        self.drain_ready_batches().await
    }

    /// Dispatches every currently-selectable batch across every
    /// transport, waits for each response, and feeds the outcomes back
    /// into the scheduler/concurrency controller/retry engine (C7 + C8).
    async fn drain_ready_batches(&self) -> Result<(), QmgrError> {
        let transports: Vec<_> = (0..self.store.transport_count() as u32)
            .map(crate::entity::TransportId::from_raw)
            .collect();

        for transport in transports {
            let transport_name = self.transport_name(transport);
            if self.config.is_deferred_transport(&transport_name) {
                continue;
            }
            let now = SystemTime::now();
            if self.store.transport(transport).is_some_and(|t| t.is_dead(now)) {
                continue;
            }
            let per_delivery_limit = self.config.transport_recipient_limit(&transport_name);
            let Some(batch) = self.scheduler.select_batch(&self.store, transport, per_delivery_limit, now) else {
                continue;
            };

            let Some(dest) = self.store.destination(batch.destination) else { continue };
            let nexthop = dest.nexthop.clone();
            drop(dest);

            let sender = self
                .messages
                .get(&batch.message)
                .map_or_else(String::new, |m| m.sender.clone());

            let last_intervals: ahash::AHashMap<u64, Duration> = batch
                .recipients
                .iter()
                .map(|r| (r.offset, Duration::from_secs(r.last_interval_secs)))
                .collect();

            let request = DispatchRequest {
                transport: transport_name.clone(),
                nexthop,
                sender,
                recipients: batch
                    .recipients
                    .iter()
                    .map(|r| DispatchRecipient {
                        offset: r.offset,
                        original_address: r.original_address.clone(),
                        rewritten_address: r.address.clone(),
                    })
                    .collect(),
            };

            let dispatcher = Dispatcher::new(self.agent.as_ref(), Duration::from_secs(30));
            match dispatcher.dispatch(request).await {
                Ok(response) => {
                    self.handle_dispatch_response(
                        transport,
                        batch.message,
                        batch.destination,
                        response,
                        &last_intervals,
                    )
                    .await?;
                }
                Err(err @ crate::dispatcher::DispatchError::AgentUnavailable { .. }) => {
                    // The agent itself couldn't be spawned for this transport; that's
                    // a transport-wide outage, not a fault of this one destination, so
                    // the transport as a whole goes dead rather than just `dest`.
                    internal!(level = WARN, "{}", QmgrError::Transport { transport: transport_name.clone(), reason: err.to_string() });
                    let retry_after = self.config.transport_retry(&transport_name);
                    if let Some(mut row) = self.store.transport_mut(transport) {
                        row.dead_until = Some(SystemTime::now() + retry_after);
                    }
                    if let Some(mut dest_row) = self.store.destination_mut(batch.destination) {
                        dest_row.in_flight = dest_row.in_flight.saturating_sub(batch.recipients.len());
                    }
                    for recipient in &batch.recipients {
                        self.reporter
                            .defer(
                                &batch.message.to_string(),
                                &recipient.original_address,
                                "delivery agent unavailable for transport",
                                SystemTime::now() + retry_after,
                            )
                            .await
                            .map_err(QmgrError::Io)?;
                    }
                }
                Err(_err) => {
                    let min_backoff = self.config.retry_policy(&transport_name).min_backoff();
                    let initial = self.config.initial_destination_concurrency(&transport_name);
                    self.concurrency.on_hard_failure(&self.store, batch.destination, min_backoff, initial);
                    self.metrics.record_dead_destination(&transport_name);
                    self.metrics.record_destination_window(&transport_name, initial);
                    for recipient in &batch.recipients {
                        self.reporter
                            .defer(
                                &batch.message.to_string(),
                                &recipient.original_address,
                                "destination unreachable",
                                SystemTime::now() + min_backoff,
                            )
                            .await
                            .map_err(QmgrError::Io)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_dispatch_response(
        &self,
        transport: crate::entity::TransportId,
        message: MessageId,
        dest: crate::entity::DestId,
        response: crate::dispatcher::DispatchResponse,
        last_intervals: &ahash::AHashMap<u64, Duration>,
    ) -> Result<(), QmgrError> {
        let transport_name = self.transport_name(transport);
        let cost = self.config.preemption_policy(&transport_name).delivery_slot_cost;
        let retry_policy = self.config.retry_policy(&transport_name);
        let retry_engine = RetryEngine::new(&retry_policy);
        let arrival = self
            .messages
            .get(&message)
            .map_or_else(SystemTime::now, |m| m.arrival_time);

        for status in &response.recipient_statuses {
            self.scheduler.record_completion(transport, message, cost);
            if status.code < 400 {
                self.concurrency.on_success(
                    &self.store,
                    dest,
                    self.config.concurrency_limit(&transport_name),
                );
                if let Some(window) = self.store.destination(dest).map(|row| row.window) {
                    self.metrics.record_destination_window(&transport_name, window);
                }
                self.reporter
                    .success(&message.to_string(), &status.reason)
                    .await
                    .map_err(QmgrError::Io)?;
            } else if status.code < 500 {
                self.concurrency.on_soft_failure(&self.store, dest);
                let last_interval = last_intervals.get(&status.offset).copied().unwrap_or_default();
                let outcome = retry_engine.on_soft_failure(arrival, last_interval);
                if let crate::message::RecipientStatus::Bounced { reason } = outcome {
                    self.reporter.bounce(&message.to_string(), &status.reason, &reason).await.map_err(QmgrError::Io)?;
                } else if let crate::message::RecipientStatus::Deferred { reason, retry_at } = outcome {
                    self.reporter
                        .defer(&message.to_string(), &status.reason, &reason, retry_at)
                        .await
                        .map_err(QmgrError::Io)?;
                }
            } else {
                self.concurrency.on_soft_failure(&self.store, dest);
                self.reporter
                    .bounce(&message.to_string(), &status.reason, "permanent delivery failure")
                    .await
                    .map_err(QmgrError::Io)?;
            }
            if let Some(mut msg) = self.messages.get_mut(&message) {
                msg.recipients_terminal += 1;
            }
        }

        if response.transport_status == TransportStatus::Ok {
            self.store.reap_destination(dest);
        }
        self.scheduler.terminate_if_done(transport, message);
        self.metrics.record_stack_depth(&transport_name, self.scheduler.stack_depth(transport));

        let complete = self.messages.get(&message).is_some_and(|m| m.is_complete());
        if complete {
            self.messages.remove(&message);
            self.active_set.lock().await.release();
            self.metrics.record_release();
        }
        Ok(())
    }
}

impl EngineQueryService for Engine {
    fn handle_trigger(&self, trigger: Trigger) {
        let _ = self.trigger_tx.send(trigger);
    }

    fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    fn job_stack_depth(&self, transport: &str) -> usize {
        let id = self.store.intern_transport(transport);
        self.scheduler.stack_depth(id)
    }

    fn destinations(&self, transport: &str) -> Vec<DestinationSnapshot> {
        let id = self.store.intern_transport(transport);
        let now = SystemTime::now();
        self.store
            .transport(id)
            .map(|t| {
                t.destinations
                    .iter()
                    .filter_map(|d| self.store.destination(*d))
                    .map(|d| DestinationSnapshot {
                        nexthop: d.nexthop.clone(),
                        in_flight: d.in_flight,
                        window: d.window,
                        pending: d.pending.len(),
                        dead: d.is_dead(now),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
