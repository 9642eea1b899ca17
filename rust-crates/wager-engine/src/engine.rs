use crate::{
    Result,
    config::EngineConfig,
    error::{
        GatewayError,
        PlaceBetError,
    },
    events::{
        DomainEvent,
        EventFilter,
        EventName,
        RawEvent,
    },
    gateway::{
        ChainGateway,
        Receipt,
        Subscription,
    },
    payout::GameRules,
    reconciler::{
        Delivery,
        EventReconciler,
        SubmissionRecord,
    },
    session::{
        Amount,
        GameSession,
        RequestId,
        SessionSnapshot,
        SessionStatus,
        TxHash,
    },
    state_machine::{
        SessionStateMachine,
        TimeoutPolicy,
        Transition,
        TransitionError,
    },
    store::{
        InMemorySessionStore,
        Reservation,
        SessionStore,
    },
};
use futures::{
    Stream,
    StreamExt,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
    time::{
        Instant,
        MissedTickBehavior,
    },
};
use tokio_stream::wrappers::WatchStream;
use tracing::{
    Instrument,
    debug,
    info,
    info_span,
    warn,
};


type Observers = Arc<Mutex<HashMap<RequestId, watch::Sender<SessionSnapshot>>>>;

enum Command {
    Track(SubmissionRecord),
    Receipt {
        request_id: RequestId,
        result: std::result::Result<Receipt, GatewayError>,
    },
    Cancel {
        request_id: RequestId,
        done: oneshot::Sender<bool>,
    },
    Acknowledge {
        request_id: RequestId,
        done: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Places bets and follows each one to a terminal state.
///
/// All session mutations happen on a single driver task, which owns the
/// reconciler and both event subscriptions, so events for one request are
/// applied strictly one at a time.
pub struct WagerEngine<G, S = InMemorySessionStore> {
    gateway: Arc<G>,
    store: S,
    rules: GameRules,
    machine: SessionStateMachine,
    observers: Observers,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<G: ChainGateway> WagerEngine<G, InMemorySessionStore> {
    pub async fn start(gateway: G, config: EngineConfig) -> Result<Self> {
        Self::start_with_store(gateway, InMemorySessionStore::new(), config).await
    }
}

impl<G: ChainGateway, S: SessionStore> WagerEngine<G, S> {
    pub async fn start_with_store(gateway: G, store: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let rules = gateway.game_rules().await?;
        rules.check()?;
        info!(
            min_bet = %rules.min_bet,
            max_bet = %rules.max_bet,
            payout_multiplier = %rules.payout_multiplier,
            "game rules loaded"
        );

        let filter = EventFilter::for_player(gateway.player()).from_block(config.start_block);
        let started = gateway.subscribe(EventName::GameStarted, filter.clone());
        let resolved = gateway.subscribe(EventName::GameResolved, filter);

        let machine = SessionStateMachine::new(TimeoutPolicy::from_config(&config));
        let observers = Observers::default();
        let (commands, receiver) = mpsc::unbounded_channel();
        let driver = Driver {
            store: store.clone(),
            machine,
            reconciler: EventReconciler::new(config.reorder_window),
            observers: observers.clone(),
            commands: receiver,
            started,
            resolved,
            config,
        };
        let handle = tokio::spawn(driver.run().instrument(info_span!("wager_driver")));

        Ok(Self {
            gateway: Arc::new(gateway),
            store,
            rules,
            machine,
            observers,
            commands,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn rules(&self) -> GameRules {
        self.rules
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Validates, signs and broadcasts a bet, then tracks it in the
    /// background. The returned handle observes the session from `PENDING`.
    pub async fn place_bet(
        &self,
        chosen_number: u8,
        bet_amount: Amount,
    ) -> std::result::Result<SessionHandle, PlaceBetError> {
        self.rules.validate_bet(chosen_number, bet_amount)?;
        if self.commands.is_closed() {
            return Err(PlaceBetError::EngineStopped);
        }
        let player = self.gateway.player();
        let reservation = Reservation::acquire(&self.store, &player)?;

        let submission = self.gateway.submit_bet(chosen_number, bet_amount).await?;
        info!(
            request_id = %submission.request_id,
            tx_hash = %submission.tx_hash,
            %player,
            chosen_number,
            bet_amount = %bet_amount,
            "bet submitted"
        );

        let session = self.machine.open(
            &submission,
            player,
            chosen_number,
            bet_amount,
            Instant::now(),
        );
        let record = SubmissionRecord::from(&session);
        let (sender, receiver) = watch::channel(session.snapshot());
        let request_id = submission.request_id.clone();
        self.observers.lock().insert(request_id.clone(), sender);
        if let Err(err) = reservation.commit(session) {
            self.observers.lock().remove(&request_id);
            return Err(err.into());
        }
        if self.commands.send(Command::Track(record)).is_err() {
            warn!(%request_id, "engine stopped while the bet was being submitted");
            self.store.evict(&request_id);
            self.observers.lock().remove(&request_id);
            return Err(PlaceBetError::EngineStopped);
        }
        self.spawn_confirmation(request_id.clone(), submission.tx_hash.clone());

        Ok(SessionHandle {
            request_id,
            tx_hash: submission.tx_hash,
            observer: SessionObserver::new(receiver),
        })
    }

    /// Snapshots of `request_id` from its current state onwards, or `None` if
    /// the session is not tracked.
    pub fn observe(&self, request_id: &RequestId) -> Option<SessionObserver> {
        self.observers
            .lock()
            .get(request_id)
            .map(|sender| SessionObserver::new(sender.subscribe()))
    }

    pub fn snapshot(&self, request_id: &RequestId) -> Option<SessionSnapshot> {
        self.store.get(request_id).map(|session| session.snapshot())
    }

    /// The player's live session, if any.
    pub fn active_session(&self) -> Option<RequestId> {
        self.store.active_session(&self.gateway.player())
    }

    /// Stops tracking a session locally. The bet itself stays on chain.
    pub async fn cancel(&self, request_id: &RequestId) -> bool {
        let (done, reply) = oneshot::channel();
        let command = Command::Cancel {
            request_id: request_id.clone(),
            done,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        reply.await.unwrap_or(false)
    }

    /// Drops a terminal session before its retention window runs out.
    pub async fn acknowledge(&self, request_id: &RequestId) -> bool {
        let (done, reply) = oneshot::channel();
        let command = Command::Acknowledge {
            request_id: request_id.clone(),
            done,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        reply.await.unwrap_or(false)
    }

    /// Cancels both subscriptions, applies whatever they had already
    /// received, and stops the driver.
    pub async fn shutdown(&self) {
        let (done, reply) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = reply.await;
        }
        let handle = self.driver.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(%err, "wager driver ended abnormally");
        }
    }

    fn spawn_confirmation(&self, request_id: RequestId, tx_hash: TxHash) {
        let gateway = self.gateway.clone();
        let commands = self.commands.clone();
        let span = info_span!("confirmation", %request_id, %tx_hash);
        tokio::spawn(
            async move {
                let result = gateway.await_confirmation(&tx_hash).await;
                if commands.send(Command::Receipt { request_id, result }).is_err() {
                    debug!("engine stopped before the receipt arrived");
                }
            }
            .instrument(span),
        );
    }
}

impl<G, S> Drop for WagerEngine<G, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

/// What `place_bet` hands back once the bet is on its way.
///
/// `request_id` is the id reported at submission. If the mined receipt shows
/// the contract assigned another one, the session moves to that id and the
/// observer's snapshots carry it from then on.
pub struct SessionHandle {
    pub request_id: RequestId,
    pub tx_hash: TxHash,
    pub observer: SessionObserver,
}

/// Push-based view of one session: yields the current snapshot, then every
/// change, and ends after the first terminal snapshot.
pub struct SessionObserver {
    updates: WatchStream<SessionSnapshot>,
    finished: bool,
}

impl SessionObserver {
    fn new(receiver: watch::Receiver<SessionSnapshot>) -> Self {
        Self {
            updates: WatchStream::new(receiver),
            finished: false,
        }
    }

    /// Runs the observer to completion and returns the last snapshot seen.
    pub async fn wait_terminal(mut self) -> Option<SessionSnapshot> {
        let mut last = None;
        while let Some(snapshot) = self.next().await {
            last = Some(snapshot);
        }
        last
    }
}

impl Stream for SessionObserver {
    type Item = SessionSnapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SessionSnapshot>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.updates.poll_next_unpin(cx) {
            Poll::Ready(Some(snapshot)) => {
                this.finished = snapshot.is_terminal();
                Poll::Ready(Some(snapshot))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Driver<S> {
    store: S,
    machine: SessionStateMachine,
    reconciler: EventReconciler,
    observers: Observers,
    commands: mpsc::UnboundedReceiver<Command>,
    started: Subscription,
    resolved: Subscription,
    config: EngineConfig,
}

impl<S: SessionStore> Driver<S> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.drain().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                Some(event) = self.started.next() => self.handle_event(event),
                Some(event) = self.resolved.next() => self.handle_event(event),
                _ = ticker.tick() => self.housekeeping(Instant::now()),
            }
        }
        info!(sessions = self.store.len(), "wager driver stopped");
    }

    async fn drain(&mut self) {
        let mut remaining = self.started.cancel().await;
        remaining.extend(self.resolved.cancel().await);
        debug!(events = remaining.len(), "applying events drained at shutdown");
        for event in remaining {
            self.handle_event(event);
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Track(record) => {
                let deliveries = self.reconciler.track(record);
                self.deliver(deliveries, now);
            }
            Command::Receipt { request_id, result } => {
                self.handle_receipt(request_id, result, now);
            }
            Command::Cancel { request_id, done } => {
                let existed = self.discard(&request_id);
                if existed {
                    info!(%request_id, "session cancelled locally");
                }
                let _ = done.send(existed);
            }
            Command::Acknowledge { request_id, done } => {
                let terminal = self
                    .store
                    .get(&request_id)
                    .is_some_and(|session| session.status().is_terminal());
                if terminal {
                    self.discard(&request_id);
                }
                let _ = done.send(terminal);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_receipt(
        &mut self,
        request_id: RequestId,
        result: std::result::Result<Receipt, GatewayError>,
        now: Instant,
    ) {
        match result {
            Ok(receipt) => {
                let rekeyed = match &receipt.started {
                    Some(started) if started.request_id != request_id => {
                        self.rekey(&request_id, &started.request_id)
                    }
                    _ => None,
                };
                let request_id = rekeyed
                    .as_ref()
                    .map_or(request_id, |session| session.request_id().clone());
                let confirmed = DomainEvent::Confirmed {
                    block_number: receipt.block_number,
                };
                self.apply(&request_id, &confirmed, now);
                if let Some(session) = rekeyed {
                    let deliveries = self.reconciler.track(SubmissionRecord::from(&session));
                    self.deliver(deliveries, now);
                }
                // the receipt's own GameStarted may beat the subscription
                if let Some(started) = receipt.started {
                    self.handle_event(started);
                }
            }
            Err(GatewayError::Reverted { reason, .. }) => {
                self.apply(&request_id, &DomainEvent::Reverted { reason }, now);
            }
            Err(GatewayError::Timeout { tx_hash }) => {
                warn!(%request_id, %tx_hash, "gave up waiting for the transaction");
                if let Some(mut session) = self.store.get(&request_id)
                    && session.status() == SessionStatus::Pending
                    && let Some(transition) = self.machine.time_out(&mut session, now)
                {
                    self.commit(session, transition);
                }
            }
            Err(err) => {
                warn!(
                    %request_id,
                    %err,
                    "confirmation lookup failed; the session deadline still applies"
                );
            }
        }
    }

    /// Moves a session from the id reported at submission to the one its
    /// receipt shows. The caller registers the moved session with the
    /// reconciler.
    fn rekey(&mut self, reported: &RequestId, assigned: &RequestId) -> Option<GameSession> {
        warn!(
            %reported,
            %assigned,
            "contract assigned a different request id than the submission reported"
        );
        let session = match self.store.rekey(reported, assigned) {
            Ok(session) => session,
            Err(err) => {
                warn!(%reported, %err, "session kept under its reported request id");
                return None;
            }
        };
        self.reconciler.forget(reported);
        let mut observers = self.observers.lock();
        if let Some(sender) = observers.remove(reported) {
            sender.send_replace(session.snapshot());
            observers.insert(assigned.clone(), sender);
        }
        Some(session)
    }

    fn handle_event(&mut self, event: RawEvent) {
        let now = Instant::now();
        let deliveries = self.reconciler.ingest(event, now);
        self.deliver(deliveries, now);
    }

    fn deliver(&mut self, deliveries: Vec<Delivery>, now: Instant) {
        for delivery in deliveries {
            self.apply(&delivery.request_id, &delivery.event, now);
        }
    }

    fn apply(&mut self, request_id: &RequestId, event: &DomainEvent, now: Instant) {
        let Some(mut session) = self.store.get(request_id) else {
            debug!(%request_id, event = event.label(), "no session for event");
            return;
        };
        match self.machine.apply(&mut session, event, now) {
            Ok(transition @ Transition::Applied { .. }) => self.commit(session, transition),
            Ok(Transition::Ignored { status, reason }) => {
                debug!(%request_id, event = event.label(), %status, reason, "event ignored");
            }
            Err(err @ TransitionError::Stale { .. })
                if matches!(event, DomainEvent::Confirmed { .. }) =>
            {
                // logs can settle a session before its receipt is polled
                debug!(%request_id, %err, "receipt arrived after the session settled");
            }
            Err(err @ TransitionError::Stale { .. }) => {
                warn!(anomaly = "STALE_EVENT", %request_id, %err, "late event discarded");
            }
            Err(err) => {
                warn!(anomaly = "INVALID_EVENT", %request_id, %err, "event rejected");
            }
        }
    }

    fn commit(&mut self, session: GameSession, transition: Transition) {
        if let Transition::Applied { from, to } = transition {
            info!(request_id = %session.request_id(), %from, %to, "session advanced");
        }
        if let Err(err) = self.store.update(&session) {
            warn!(%err, "session vanished before its transition was stored");
            return;
        }
        if let Some(sender) = self.observers.lock().get(session.request_id()) {
            sender.send_replace(session.snapshot());
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        for mut session in self.store.overdue(now) {
            if let Some(transition) = self.machine.expire(&mut session, now) {
                warn!(
                    request_id = %session.request_id(),
                    status = %session.status(),
                    "session deadline passed"
                );
                self.commit(session, transition);
            }
        }
        self.reconciler.expire(now);
        for request_id in self
            .store
            .expired_terminal(now, self.config.retention_window)
        {
            debug!(%request_id, "evicting settled session");
            self.discard(&request_id);
        }
    }

    /// Removes every trace of a session and ends its observers.
    fn discard(&mut self, request_id: &RequestId) -> bool {
        let existed = self.store.evict(request_id).is_some();
        self.reconciler.forget(request_id);
        self.observers.lock().remove(request_id);
        existed
    }
}
