use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::pending,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::future::join_all;
use messaging_core::{
    ContactCenterError, ContactCenterEvent, EventGateway, EventStream, FetchOutcome, PollAction,
    PollChannelError, PollChannels, PollCommand, PollPhase, PollStateMachine, PollerConfig,
    PollerEvent, RegistryChange, RetryPolicy, SessionBackoff, SessionDelivery, SessionFeedback,
    SessionRegistry, normalize_fetch_outcome,
};
use messaging_platform::{LifecycleSource, LifecycleState, LifecycleSubscription};
use tokio::{
    sync::{broadcast, mpsc},
    task::{JoinError, JoinHandle},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RunningCycle {
    id: u64,
    /// Registration generation of every session fetched by this cycle.
    generations: BTreeMap<String, u64>,
    stop: CancellationToken,
    task: JoinHandle<Vec<FetchOutcome>>,
}

/// Lossless per-callback delivery queues, closed when the runtime stops.
#[derive(Clone, Debug, Default)]
struct DeliverySinks {
    inner: Arc<Mutex<SinkState>>,
}

#[derive(Debug, Default)]
struct SinkState {
    sinks: Vec<mpsc::UnboundedSender<SessionDelivery>>,
    closed: bool,
}

impl DeliverySinks {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionDelivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            state.sinks.push(tx);
        }
        rx
    }

    fn send(&self, delivery: &SessionDelivery) {
        self.lock()
            .sinks
            .retain(|sink| sink.send(delivery.clone()).is_ok());
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sinks.clear();
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable control surface of a running poller.
///
/// The runtime stops when `shutdown` is called or every handle is dropped.
#[derive(Clone, Debug)]
pub struct PollerHandle {
    channels: PollChannels,
    registry: SessionRegistry,
    deliveries: DeliverySinks,
}

impl PollerHandle {
    /// Start polling `chat_id`. Registering a tracked ID is a no-op.
    pub fn register(&self, chat_id: impl Into<String>) -> Result<RegistryChange, PollChannelError> {
        let change = self.registry.register(chat_id);
        self.notify(change)?;
        Ok(change)
    }

    /// Stop polling `chat_id`. Removing the last ID cancels in-flight work.
    pub fn deregister(&self, chat_id: &str) -> Result<RegistryChange, PollChannelError> {
        let change = self.registry.deregister(chat_id);
        self.notify(change)?;
        Ok(change)
    }

    pub fn deregister_all(&self) -> Result<RegistryChange, PollChannelError> {
        let change = self.registry.clear();
        self.notify(change)?;
        Ok(change)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.registry.snapshot()
    }

    pub fn is_registered(&self, chat_id: &str) -> bool {
        self.registry.contains(chat_id)
    }

    pub fn set_foreground(&self, foreground: bool) -> Result<(), PollChannelError> {
        self.channels
            .send_command(PollCommand::SetForeground(foreground))
    }

    pub fn set_network_reachable(&self, reachable: bool) -> Result<(), PollChannelError> {
        self.channels
            .send_command(PollCommand::SetNetworkReachable(reachable))
    }

    /// Run the pending cycle immediately. Ignored while a cycle is in flight.
    pub fn poll_now(&self) -> Result<(), PollChannelError> {
        self.channels.send_command(PollCommand::PollNow)
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Invoke `callback` for every per-session delivery until the runtime stops.
    ///
    /// Deliveries are queued without bound, so a slow callback never skips one.
    pub fn on_delivery<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(&str, Result<Vec<ContactCenterEvent>, ContactCenterError>) + Send + 'static,
    {
        let mut deliveries = self.deliveries.subscribe();
        tokio::spawn(async move {
            while let Some(SessionDelivery { chat_id, result }) = deliveries.recv().await {
                callback(&chat_id, result);
            }
        })
    }

    pub fn shutdown(&self) -> Result<(), PollChannelError> {
        self.channels.send_command(PollCommand::Shutdown)
    }

    pub fn is_running(&self) -> bool {
        !self.channels.is_closed()
    }

    fn notify(&self, change: RegistryChange) -> Result<(), PollChannelError> {
        if change.affects_run_condition() {
            self.channels
                .send_command(PollCommand::SessionsChanged(change))?;
        }
        Ok(())
    }
}

/// Spawn a poller driven only by handle calls for lifecycle input.
pub fn spawn_poller<G: EventGateway>(gateway: Arc<G>, config: PollerConfig) -> PollerHandle {
    spawn(gateway, config, None)
}

/// Spawn a poller that also follows `lifecycle`, starting from its current state.
pub fn spawn_poller_with_lifecycle<G, L>(
    gateway: Arc<G>,
    config: PollerConfig,
    lifecycle: &L,
) -> PollerHandle
where
    G: EventGateway,
    L: LifecycleSource + ?Sized,
{
    spawn(gateway, config, Some(lifecycle.subscribe()))
}

fn spawn<G: EventGateway>(
    gateway: Arc<G>,
    config: PollerConfig,
    lifecycle: Option<LifecycleSubscription>,
) -> PollerHandle {
    let (channels, command_rx) = PollChannels::new(config.event_buffer);
    let registry = SessionRegistry::new();
    let deliveries = DeliverySinks::default();
    let runtime = PollRuntime::new(
        gateway,
        registry.clone(),
        channels.event_sender(),
        deliveries.clone(),
        command_rx,
        lifecycle,
        &config,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    PollerHandle {
        channels,
        registry,
        deliveries,
    }
}

struct PollRuntime<G> {
    gateway: Arc<G>,
    registry: SessionRegistry,
    event_tx: broadcast::Sender<PollerEvent>,
    deliveries: DeliverySinks,
    command_rx: mpsc::UnboundedReceiver<PollCommand>,
    lifecycle: Option<LifecycleSubscription>,
    machine: PollStateMachine,
    reported_phase: PollPhase,
    retry: Option<RetryPolicy>,
    wake_at: Option<Instant>,
    cycle: Option<RunningCycle>,
    next_cycle_id: u64,
    backoff: HashMap<String, SessionBackoff>,
}

impl<G: EventGateway> PollRuntime<G> {
    fn new(
        gateway: Arc<G>,
        registry: SessionRegistry,
        event_tx: broadcast::Sender<PollerEvent>,
        deliveries: DeliverySinks,
        command_rx: mpsc::UnboundedReceiver<PollCommand>,
        lifecycle: Option<LifecycleSubscription>,
        config: &PollerConfig,
    ) -> Self {
        let machine = PollStateMachine::new(config);
        Self {
            gateway,
            registry,
            event_tx,
            deliveries,
            command_rx,
            lifecycle,
            reported_phase: machine.phase(),
            machine,
            retry: config.retry,
            wake_at: None,
            cycle: None,
            next_cycle_id: 0,
            backoff: HashMap::new(),
        }
    }

    async fn run(mut self) {
        if let Some(state) = self.lifecycle.as_ref().map(LifecycleSubscription::current) {
            self.apply_lifecycle(state);
        }
        let has_sessions = !self.registry.is_empty();
        let action = self.machine.on_sessions_changed(has_sessions);
        self.apply(action);

        loop {
            let wake_at = self.wake_at;
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(PollCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                change = next_lifecycle_change(&mut self.lifecycle) => match change {
                    Some(state) => self.apply_lifecycle(state),
                    None => {
                        debug!("lifecycle source closed");
                        self.lifecycle = None;
                    }
                },
                () = sleep_until_deadline(wake_at) => {
                    self.wake_at = None;
                    let action = self.machine.on_wake();
                    self.apply(action);
                }
                result = join_cycle(&mut self.cycle) => self.finish_cycle(result),
            }
        }

        self.cancel_cycle();
        self.wake_at = None;
        self.deliveries.close();
        if self.reported_phase != PollPhase::Idle {
            self.reported_phase = PollPhase::Idle;
            self.emit(PollerEvent::PhaseChanged {
                phase: PollPhase::Idle,
            });
        }
        info!("poller stopped");
    }

    fn handle_command(&mut self, command: PollCommand) {
        let action = match command {
            PollCommand::SessionsChanged(change) => {
                // The set may already be refilled; the old cycle is cancelled regardless.
                if change == RegistryChange::Deactivated {
                    let action = self.machine.on_sessions_changed(false);
                    self.apply(action);
                }
                let has_sessions = !self.registry.is_empty();
                self.machine.on_sessions_changed(has_sessions)
            }
            PollCommand::SetForeground(foreground) => {
                info!(foreground, "app foreground state changed");
                self.machine.on_foreground(foreground)
            }
            PollCommand::SetNetworkReachable(reachable) => {
                info!(reachable, "network reachability changed");
                self.machine.on_network_reachable(reachable)
            }
            PollCommand::PollNow => self.machine.poll_now(),
            PollCommand::Shutdown => None,
        };
        self.apply(action);
    }

    fn apply_lifecycle(&mut self, state: LifecycleState) {
        if state.foreground != self.machine.is_foreground() {
            info!(foreground = state.foreground, "app foreground state changed");
            let action = self.machine.on_foreground(state.foreground);
            self.apply(action);
        }
        if state.network_reachable != self.machine.is_network_reachable() {
            info!(
                reachable = state.network_reachable,
                "network reachability changed"
            );
            let action = self.machine.on_network_reachable(state.network_reachable);
            self.apply(action);
        }
    }

    fn apply(&mut self, action: Option<PollAction>) {
        match action {
            Some(PollAction::ScheduleWake(delay)) => {
                debug!(delay_ms = delay.as_millis() as u64, "scheduled poll wake-up");
                self.wake_at = Some(Instant::now() + delay);
            }
            Some(PollAction::StartCycle) => self.start_cycle(),
            Some(PollAction::CancelCycle) => {
                self.cancel_cycle();
                self.wake_at = None;
            }
            Some(PollAction::CancelWake) => self.wake_at = None,
            None => {}
        }

        let phase = self.machine.phase();
        if phase != self.reported_phase {
            self.reported_phase = phase;
            self.emit(PollerEvent::PhaseChanged { phase });
        }
    }

    fn start_cycle(&mut self) {
        let now = Instant::now();
        let generations: BTreeMap<String, u64> = self
            .registry
            .generations()
            .into_iter()
            .filter(|(chat_id, _)| {
                self.backoff
                    .get(chat_id)
                    .is_none_or(|backoff| backoff.is_ready(now))
            })
            .collect();
        let chat_ids: Vec<String> = generations.keys().cloned().collect();

        let id = self.next_cycle_id;
        self.next_cycle_id = self.next_cycle_id.wrapping_add(1);
        debug!(cycle = id, sessions = chat_ids.len(), "starting poll cycle");

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let gateway = Arc::clone(&self.gateway);
        let task = tokio::spawn(async move {
            let fetches = chat_ids.into_iter().map(|chat_id| {
                let gateway = Arc::clone(&gateway);
                async move {
                    let result = gateway.fetch_new_events(&chat_id).await;
                    FetchOutcome { chat_id, result }
                }
            });

            tokio::select! {
                _ = stop_child.cancelled() => Vec::new(),
                outcomes = join_all(fetches) => outcomes,
            }
        });

        self.cycle = Some(RunningCycle {
            id,
            generations,
            stop,
            task,
        });
    }

    fn cancel_cycle(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            cycle.stop.cancel();
            cycle.task.abort();
            info!(cycle = cycle.id, "cancelled in-flight poll cycle");
        }
    }

    fn finish_cycle(&mut self, result: Result<Vec<FetchOutcome>, JoinError>) {
        let Some(cycle) = self.cycle.take() else {
            return;
        };
        let outcomes = result.unwrap_or_else(|err| {
            warn!(cycle = cycle.id, error = %err, "poll cycle task failed");
            Vec::new()
        });
        debug!(cycle = cycle.id, outcomes = outcomes.len(), "poll cycle finished");

        let now = Instant::now();
        for outcome in outcomes {
            let Some(generation) = cycle.generations.get(&outcome.chat_id).copied() else {
                continue;
            };
            if self.registry.generation(&outcome.chat_id) != Some(generation) {
                debug!(chat_id = %outcome.chat_id, "discarding result for a stale registration");
                continue;
            }

            let (delivery, feedback) = normalize_fetch_outcome(outcome);
            let chat_id = delivery.chat_id.clone();
            if !matches!(&delivery.result, Ok(events) if events.is_empty()) {
                self.deliveries.send(&delivery);
                self.emit(PollerEvent::Delivery(delivery));
            }

            match feedback {
                SessionFeedback::Healthy => {
                    self.backoff.remove(&chat_id);
                }
                SessionFeedback::Failed { retry_after_ms } => {
                    if let Some(policy) = self.retry {
                        let delay = self
                            .backoff
                            .entry(chat_id.clone())
                            .or_default()
                            .record_failure(&policy, now, retry_after_ms);
                        debug!(
                            chat_id = %chat_id,
                            delay_ms = delay.as_millis() as u64,
                            "backing off failed session"
                        );
                    }
                }
                SessionFeedback::Deregister(reason) => {
                    self.registry.deregister_generation(&chat_id, generation);
                    self.backoff.remove(&chat_id);
                    info!(chat_id = %chat_id, ?reason, "session deregistered");
                    self.emit(PollerEvent::SessionRemoved { chat_id, reason });
                }
            }
        }

        let registry = &self.registry;
        self.backoff.retain(|chat_id, _| registry.contains(chat_id));

        let has_sessions = !self.registry.is_empty();
        let action = self.machine.on_cycle_finished(has_sessions);
        self.apply(action);
    }

    fn emit(&self, event: PollerEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn next_lifecycle_change(
    lifecycle: &mut Option<LifecycleSubscription>,
) -> Option<LifecycleState> {
    match lifecycle {
        Some(subscription) => subscription.changed().await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn join_cycle(
    cycle: &mut Option<RunningCycle>,
) -> Result<Vec<FetchOutcome>, JoinError> {
    match cycle {
        Some(running) => (&mut running.task).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use messaging_core::{RawEvent, RemovalReason};
    use messaging_platform::ManualLifecycle;
    use serde_json::{Value, json, value::RawValue};
    use tokio::{
        sync::{Notify, broadcast::error::RecvError},
        time::timeout,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(30);

    enum Reply {
        Events(Vec<Value>),
        Fail(ContactCenterError),
        Gated(Arc<Notify>, Vec<Value>),
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl<'a> InFlight<'a> {
        fn enter(counter: &'a AtomicUsize) -> Self {
            counter.fetch_add(1, Ordering::SeqCst);
            Self(counter)
        }
    }

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct ScriptedGateway {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: mpsc::UnboundedSender<(String, Instant)>,
        call_count: AtomicUsize,
        in_flight: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Instant)>) {
            let (calls, calls_rx) = mpsc::unbounded_channel();
            let gateway = Self {
                replies: Mutex::new(HashMap::new()),
                calls,
                call_count: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            };
            (Arc::new(gateway), calls_rx)
        }

        fn script(&self, chat_id: &str, reply: Reply) {
            self.replies
                .lock()
                .expect("script lock")
                .entry(chat_id.to_owned())
                .or_default()
                .push_back(reply);
        }

        fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    fn raw_batch(items: Vec<Value>) -> Vec<RawEvent> {
        items
            .into_iter()
            .map(|item| RawValue::from_string(item.to_string()).expect("valid raw json"))
            .collect()
    }

    #[async_trait]
    impl EventGateway for ScriptedGateway {
        async fn fetch_new_events(
            &self,
            chat_id: &str,
        ) -> Result<Vec<RawEvent>, ContactCenterError> {
            let _in_flight = InFlight::enter(&self.in_flight);
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let _ = self.calls.send((chat_id.to_owned(), Instant::now()));

            let reply = {
                let mut replies = self.replies.lock().expect("script lock");
                replies.get_mut(chat_id).and_then(VecDeque::pop_front)
            };
            match reply {
                None => Ok(Vec::new()),
                Some(Reply::Events(items)) => Ok(raw_batch(items)),
                Some(Reply::Fail(err)) => Err(err),
                Some(Reply::Gated(gate, items)) => {
                    gate.notified().await;
                    Ok(raw_batch(items))
                }
            }
        }
    }

    async fn next_matching<T>(
        events: &mut EventStream,
        mut pick: impl FnMut(PollerEvent) -> Option<T>,
    ) -> T {
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for poller event")
    }

    async fn wait_for_phase(events: &mut EventStream, phase: PollPhase) {
        next_matching(events, |event| {
            matches!(event, PollerEvent::PhaseChanged { phase: seen } if seen == phase).then_some(())
        })
        .await
    }

    async fn collect_for(events: &mut EventStream, window: Duration) -> Vec<PollerEvent> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            seen.push(event);
        }
        seen
    }

    async fn next_call(calls: &mut mpsc::UnboundedReceiver<(String, Instant)>) -> (String, Instant) {
        timeout(WAIT, calls.recv())
            .await
            .expect("timed out waiting for fetch")
            .expect("gateway dropped")
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_chat_scenario_and_deregisters_ended_session() {
        let (gateway, mut calls) = ScriptedGateway::new();
        gateway.script(
            "chat-1",
            Reply::Events(vec![
                json!({"event": "chat_session_message", "msg_id": "m1", "msg": "hi"}),
                json!({"event": "chat_session_ended"}),
            ]),
        );
        let handle = spawn_poller(gateway.clone(), PollerConfig::default());
        let mut events = handle.subscribe();

        handle.register("chat-1").expect("register should work");

        let delivery = next_matching(&mut events, |event| match event {
            PollerEvent::Delivery(delivery) => Some(delivery),
            _ => None,
        })
        .await;
        assert_eq!(delivery.chat_id, "chat-1");
        assert_eq!(
            delivery.result.expect("batch should decode"),
            vec![
                ContactCenterEvent::MessageReceived {
                    message_id: Some("m1".into()),
                    party_id: None,
                    message: "hi".into(),
                    timestamp: None,
                },
                ContactCenterEvent::SessionEnded,
            ]
        );

        let removed = next_matching(&mut events, |event| match event {
            PollerEvent::SessionRemoved { chat_id, reason } => Some((chat_id, reason)),
            _ => None,
        })
        .await;
        assert_eq!(removed, ("chat-1".to_owned(), RemovalReason::Ended));
        assert!(handle.snapshot().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(next_call(&mut calls).await.0, "chat-1");
        assert!(calls.try_recv().is_err());
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn registering_fetches_within_one_interval() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let config = PollerConfig {
            initial_delay: Duration::from_secs(1),
            ..PollerConfig::default()
        };
        let handle = spawn_poller(gateway, config);
        let started = Instant::now();

        assert_eq!(
            handle.register("chat-1").expect("register should work"),
            RegistryChange::Activated
        );

        let (chat_id, at) = next_call(&mut calls).await;
        assert_eq!(chat_id, "chat-1");
        assert!(at.duration_since(started) <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deregistering_last_session_stops_fetching() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let handle = spawn_poller(gateway.clone(), PollerConfig::default());

        handle.register("chat-1").expect("register should work");
        next_call(&mut calls).await;

        assert_eq!(
            handle.deregister("chat-1").expect("deregister should work"),
            RegistryChange::Deactivated
        );
        let before = gateway.call_count();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.call_count(), before);

        handle.register("chat-2").expect("register should work");
        assert_eq!(next_call(&mut calls).await.0, "chat-2");
    }

    #[tokio::test(start_paused = true)]
    async fn backgrounding_cancels_requests_and_drops_late_results() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let gate = Arc::new(Notify::new());
        gateway.script(
            "chat-1",
            Reply::Gated(
                gate.clone(),
                vec![json!({"event": "chat_session_typing", "party_id": "agent"})],
            ),
        );
        let handle = spawn_poller(gateway.clone(), PollerConfig::default());
        let mut events = handle.subscribe();

        handle.register("chat-1").expect("register should work");
        next_call(&mut calls).await;
        wait_for_phase(&mut events, PollPhase::Polling).await;
        assert_eq!(gateway.in_flight.load(Ordering::SeqCst), 1);

        handle.set_foreground(false).expect("command should enqueue");
        wait_for_phase(&mut events, PollPhase::Idle).await;
        timeout(WAIT, async {
            while gateway.in_flight.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("in-flight request should be dropped");

        gate.notify_waiters();
        let seen = collect_for(&mut events, Duration::from_secs(5)).await;
        assert!(
            !seen
                .iter()
                .any(|event| matches!(event, PollerEvent::Delivery(_))),
            "cancelled results must not be delivered: {seen:?}"
        );
        assert!(calls.try_recv().is_err());
        assert!(handle.is_registered("chat-1"));

        handle.set_foreground(true).expect("command should enqueue");
        assert_eq!(next_call(&mut calls).await.0, "chat-1");
    }

    #[tokio::test(start_paused = true)]
    async fn session_not_found_deregisters_after_cycle() {
        let (gateway, _calls) = ScriptedGateway::new();
        gateway.script("gone", Reply::Fail(ContactCenterError::SessionNotFound));
        let handle = spawn_poller(gateway, PollerConfig::default());
        let mut events = handle.subscribe();

        handle.register("gone").expect("register should work");
        handle.register("alive").expect("register should work");

        let delivery = next_matching(&mut events, |event| match event {
            PollerEvent::Delivery(delivery) => Some(delivery),
            _ => None,
        })
        .await;
        assert_eq!(delivery.chat_id, "gone");
        assert_eq!(delivery.result, Err(ContactCenterError::SessionNotFound));

        next_matching(&mut events, |event| {
            matches!(
                event,
                PollerEvent::SessionRemoved {
                    reason: RemovalReason::NotFound,
                    ..
                }
            )
            .then_some(())
        })
        .await;
        assert_eq!(handle.snapshot(), BTreeSet::from(["alive".to_owned()]));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_session_does_not_block_siblings_and_is_retried() {
        let (gateway, mut calls) = ScriptedGateway::new();
        gateway.script("chat-a", Reply::Fail(ContactCenterError::Timeout));
        gateway.script(
            "chat-b",
            Reply::Events(vec![json!({"event": "chat_session_not_typing"})]),
        );
        let handle = spawn_poller(gateway, PollerConfig::default());
        let mut events = handle.subscribe();

        handle.register("chat-a").expect("register should work");
        handle.register("chat-b").expect("register should work");

        let mut deliveries = HashMap::new();
        while deliveries.len() < 2 {
            let delivery = next_matching(&mut events, |event| match event {
                PollerEvent::Delivery(delivery) => Some(delivery),
                _ => None,
            })
            .await;
            deliveries.insert(delivery.chat_id, delivery.result);
        }
        assert_eq!(deliveries["chat-a"], Err(ContactCenterError::Timeout));
        assert_eq!(
            deliveries["chat-b"],
            Ok(vec![ContactCenterEvent::NotTyping {
                party_id: None,
                timestamp: None,
            }])
        );

        let mut retried = 0;
        while retried < 2 {
            if next_call(&mut calls).await.0 == "chat-a" {
                retried += 1;
            }
        }
        assert!(handle.is_registered("chat-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn follows_lifecycle_source_reachability() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let lifecycle = ManualLifecycle::new(LifecycleState {
            foreground: true,
            network_reachable: false,
        });
        let handle = spawn_poller_with_lifecycle(gateway.clone(), PollerConfig::default(), &lifecycle);

        handle.register("chat-1").expect("register should work");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.call_count(), 0);

        lifecycle.set_network_reachable(true);
        assert_eq!(next_call(&mut calls).await.0, "chat-1");

        let mut events = handle.subscribe();
        lifecycle.set_network_reachable(false);
        wait_for_phase(&mut events, PollPhase::Idle).await;
        let before = gateway.call_count();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.call_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_now_skips_the_remaining_interval() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let config = PollerConfig {
            poll_interval: Duration::from_secs(60),
            ..PollerConfig::default()
        };
        let handle = spawn_poller(gateway, config);
        let mut events = handle.subscribe();

        handle.register("chat-1").expect("register should work");
        let (_, first) = next_call(&mut calls).await;
        wait_for_phase(&mut events, PollPhase::Polling).await;
        wait_for_phase(&mut events, PollPhase::Scheduled).await;

        handle.poll_now().expect("command should enqueue");
        let (_, second) = next_call(&mut calls).await;
        assert!(second.duration_since(first) < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_backoff_delays_failed_session() {
        let (gateway, mut calls) = ScriptedGateway::new();
        gateway.script(
            "chat-1",
            Reply::Fail(ContactCenterError::Network("reset".into())),
        );
        let config = PollerConfig {
            retry: Some(RetryPolicy::new(5_000, 5_000)),
            ..PollerConfig::default()
        };
        let handle = spawn_poller(gateway, config);

        handle.register("chat-1").expect("register should work");
        let (_, failed_at) = next_call(&mut calls).await;
        let (_, retried_at) = next_call(&mut calls).await;
        assert!(retried_at.duration_since(failed_at) >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_callback_receives_session_results() {
        let (gateway, _calls) = ScriptedGateway::new();
        gateway.script(
            "chat-1",
            Reply::Events(vec![json!({"event": "chat_session_status", "state": "connected", "ewt": 0})]),
        );
        let handle = spawn_poller(gateway, PollerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _callback = handle.on_delivery(move |chat_id, result| {
            let _ = tx.send((chat_id.to_owned(), result));
        });

        handle.register("chat-1").expect("register should work");

        let (chat_id, result) = timeout(WAIT, rx.recv())
            .await
            .expect("callback should fire")
            .expect("callback channel open");
        assert_eq!(chat_id, "chat-1");
        assert_eq!(result.expect("events").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refilling_emptied_registry_cancels_the_running_cycle() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let gate = Arc::new(Notify::new());
        gateway.script(
            "chat-1",
            Reply::Gated(gate.clone(), vec![json!({"event": "chat_session_ended"})]),
        );
        let handle = spawn_poller(gateway.clone(), PollerConfig::default());
        let mut events = handle.subscribe();

        handle.register("chat-1").expect("register should work");
        next_call(&mut calls).await;
        wait_for_phase(&mut events, PollPhase::Polling).await;

        assert_eq!(
            handle.deregister("chat-1").expect("deregister should work"),
            RegistryChange::Deactivated
        );
        assert_eq!(
            handle.register("chat-1").expect("register should work"),
            RegistryChange::Activated
        );

        wait_for_phase(&mut events, PollPhase::Idle).await;
        assert_eq!(next_call(&mut calls).await.0, "chat-1");
        timeout(WAIT, async {
            while gateway.in_flight.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cancelled request should be dropped");

        gate.notify_one();
        let seen = collect_for(&mut events, Duration::from_secs(5)).await;
        assert!(
            !seen.iter().any(|event| matches!(
                event,
                PollerEvent::Delivery(_) | PollerEvent::SessionRemoved { .. }
            )),
            "results of the cancelled cycle must not surface: {seen:?}"
        );
        assert_eq!(handle.snapshot(), BTreeSet::from(["chat-1".to_owned()]));
    }

    #[tokio::test(start_paused = true)]
    async fn result_for_replaced_registration_is_discarded() {
        let (gateway, mut calls) = ScriptedGateway::new();
        let gate = Arc::new(Notify::new());
        gateway.script(
            "chat-1",
            Reply::Gated(gate.clone(), vec![json!({"event": "chat_session_ended"})]),
        );
        let handle = spawn_poller(gateway, PollerConfig::default());
        let mut events = handle.subscribe();

        handle.register("chat-2").expect("register should work");
        handle.register("chat-1").expect("register should work");
        while next_call(&mut calls).await.0 != "chat-1" {}

        assert_eq!(
            handle.deregister("chat-1").expect("deregister should work"),
            RegistryChange::Updated
        );
        assert_eq!(
            handle.register("chat-1").expect("register should work"),
            RegistryChange::Updated
        );

        gate.notify_one();
        let seen = collect_for(&mut events, Duration::from_secs(5)).await;
        assert!(
            !seen.iter().any(|event| match event {
                PollerEvent::Delivery(delivery) => delivery.chat_id == "chat-1",
                PollerEvent::SessionRemoved { .. } => true,
                _ => false,
            }),
            "stale result must not reach the new registration: {seen:?}"
        );
        assert_eq!(
            handle.snapshot(),
            BTreeSet::from(["chat-1".to_owned(), "chat-2".to_owned()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_callback_outlasts_small_event_buffer() {
        let (gateway, _calls) = ScriptedGateway::new();
        let chat_ids: Vec<String> = (0..5).map(|i| format!("chat-{i}")).collect();
        for chat_id in &chat_ids {
            gateway.script(
                chat_id,
                Reply::Events(vec![json!({"event": "chat_session_not_typing"})]),
            );
        }
        let config = PollerConfig {
            event_buffer: 1,
            ..PollerConfig::default()
        };
        let handle = spawn_poller(gateway, config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _callback = handle.on_delivery(move |chat_id, _| {
            let _ = tx.send(chat_id.to_owned());
        });

        for chat_id in &chat_ids {
            handle.register(chat_id.clone()).expect("register should work");
        }

        let mut delivered = BTreeSet::new();
        while delivered.len() < chat_ids.len() {
            let chat_id = timeout(WAIT, rx.recv())
                .await
                .expect("callback should fire")
                .expect("callback channel open");
            delivered.insert(chat_id);
        }
        assert_eq!(delivered, chat_ids.into_iter().collect::<BTreeSet<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_runtime() {
        let (gateway, _calls) = ScriptedGateway::new();
        let handle = spawn_poller(gateway, PollerConfig::default());
        assert!(handle.is_running());

        handle.shutdown().expect("command should enqueue");
        timeout(WAIT, async {
            while handle.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runtime should stop");

        assert_eq!(
            handle.register("chat-1"),
            Err(PollChannelError::CommandChannelClosed)
        );

        let callback = handle.on_delivery(|_, _| {});
        timeout(WAIT, callback)
            .await
            .expect("callback should end with the runtime")
            .expect("callback task should not panic");
    }
}
