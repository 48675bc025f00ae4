//! Session Controller
//!
//! Owns the tunnel lifecycle and the three recovery policies:
//! - underlying-network rebinding with a single delayed retry
//! - throttled socket resets on network/link changes
//! - debounced, rate-limited two-phase failover probing
//!
//! All mutation happens on one actor task. Commands, timer fires, probe
//! results and underlay updates are funneled into a single `select!` loop,
//! so no two engine calls that change tunnel state ever overlap.

use crate::engine::{CurrentNetwork, EngineError, TunnelEngine};
use crate::facade::FetchError;
use crate::failover::{FailoverProbe, ProbeOutcome};
use crate::policy::{self, ProbeReason, ThrottleClock};
use crate::settings::SessionSettings;
use crate::state::{SessionState, SessionStatus};
use crate::timer::OneShot;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use veil_network::{NetworkId, NetworkSource, NetworkTracker, UnderlayState};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session already {0}")]
    AlreadyActive(SessionState),

    #[error("Start failed: {0}")]
    Start(#[from] EngineError),

    #[error("Config fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Session controller closed")]
    Closed,
}

impl SessionError {
    /// Cancellation is expected control flow, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

enum Command {
    Start {
        config: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Internal {
    StartFinished {
        epoch: u64,
        result: Result<(), EngineError>,
    },
    RetryDue {
        ticket: u64,
    },
    ProbeDue {
        ticket: u64,
        reason: ProbeReason,
        expected: NetworkId,
    },
    ProbeFinished {
        epoch: u64,
        run: u64,
        outcome: ProbeOutcome,
    },
}

/// Handle to a running session controller
///
/// Cheap to clone; every clone talks to the same actor. The actor stops
/// the session and exits once every handle is dropped or
/// [`SessionController::shutdown`] is called.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    status: watch::Receiver<SessionStatus>,
    current: CurrentNetwork,
    stop_timeout: Duration,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionController {
    /// Spawn the controller actor on the current runtime
    pub fn spawn(engine: Arc<dyn TunnelEngine>, source: Arc<dyn NetworkSource>, settings: SessionSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Down);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let current = CurrentNetwork::new();
        let stop_timeout = settings.stop_timeout();

        let session = Session {
            engine,
            source,
            settings,
            state_tx,
            status_tx,
            current: current.clone(),
            internal_tx,
            epoch: 0,
            tracker: None,
            underlay: None,
            last_underlay: None,
            applied: None,
            pending_apply: None,
            retry: ApplyRetry::new(),
            clock: ThrottleClock::default(),
            probe_timer: OneShot::new(),
            probe_task: None,
            probe_run: 0,
            starting: None,
        };
        let task = tokio::spawn(session.run(commands_rx, internal_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            status: status_rx,
            current,
            stop_timeout,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Start a session with `config` and wait until it is up or has failed.
    ///
    /// Rejected with [`SessionError::AlreadyActive`] unless the session is
    /// `Down` or `Error`. Dropping the returned future does not abort the
    /// start; call [`SessionController::stop`] for that.
    pub async fn start(&self, config: String) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { config, reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Cancelled)?
    }

    /// Tear the session down. Idempotent, bounded by the stop deadline.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).is_err() {
            return;
        }
        if tokio::time::timeout(self.stop_timeout * 2, rx).await.is_err() {
            warn!("Session stop did not complete within {:?}", self.stop_timeout * 2);
        }
    }

    /// Stop the session and end the controller task.
    ///
    /// The task is aborted if it does not exit in time.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok()
            && tokio::time::timeout(self.stop_timeout * 2, rx).await.is_err()
        {
            warn!("Session shutdown did not complete within {:?}", self.stop_timeout * 2);
        }

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
                warn!("Session task still running, aborting");
                task.abort();
            }
        }
    }

    /// Observe session state
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Observe the user-visible status category
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Underlay network the tunnel currently rides on
    pub fn current_network(&self) -> Option<NetworkId> {
        self.current.get()
    }
}

/// Outstanding retry of a failed rebind
struct ApplyRetry {
    target: Option<NetworkId>,
    scheduled: bool,
    timer: OneShot,
}

impl ApplyRetry {
    fn new() -> Self {
        Self {
            target: None,
            scheduled: false,
            timer: OneShot::new(),
        }
    }

    fn clear(&mut self) {
        self.target = None;
        self.scheduled = false;
        self.timer.cancel();
    }
}

/// In-flight engine start
struct Starting {
    task: JoinHandle<()>,
    reply: oneshot::Sender<Result<(), SessionError>>,
}

/// Actor state
struct Session {
    engine: Arc<dyn TunnelEngine>,
    source: Arc<dyn NetworkSource>,
    settings: SessionSettings,
    state_tx: watch::Sender<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    current: CurrentNetwork,
    internal_tx: mpsc::UnboundedSender<Internal>,

    /// Bumped on every start and teardown; results of older runs are stale
    epoch: u64,
    tracker: Option<NetworkTracker>,
    underlay: Option<watch::Receiver<UnderlayState>>,
    last_underlay: Option<UnderlayState>,

    /// Last network successfully bound to the tunnel
    applied: Option<NetworkId>,
    /// Network observed while still connecting
    pending_apply: Option<NetworkId>,
    retry: ApplyRetry,

    clock: ThrottleClock,
    probe_timer: OneShot,
    probe_task: Option<JoinHandle<()>>,
    probe_run: u64,

    starting: Option<Starting>,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        debug!("Session controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { config, reply }) => self.start(config, reply),
                    Some(Command::Stop { done }) => {
                        self.stop().await;
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.stop().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(message) = internal.recv() => self.on_internal(message).await,
                update = next_underlay(&mut self.underlay) => match update {
                    Some(state) => self.on_underlay(state).await,
                    None => self.underlay = None,
                },
            }
        }

        debug!("Session controller stopped");
    }

    fn start(&mut self, config: String, reply: oneshot::Sender<Result<(), SessionError>>) {
        let state = self.state_tx.borrow().clone();
        if !state.can_start() {
            debug!("Start ignored, session is {}", state);
            let _ = reply.send(Err(SessionError::AlreadyActive(state)));
            return;
        }

        info!("Starting session");
        self.epoch += 1;
        self.set_state(SessionState::Connecting);
        self.set_status(SessionStatus::Connecting);

        let tracker = NetworkTracker::new(self.source.clone());
        self.underlay = Some(tracker.subscribe());
        tracker.start();
        self.tracker = Some(tracker);

        let engine = self.engine.clone();
        let current = self.current.clone();
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        let task = tokio::spawn(async move {
            let result = if config.trim().is_empty() {
                Err(EngineError::InvalidConfig("config is empty".to_string()))
            } else {
                engine.start(&config, current).await
            };
            let _ = tx.send(Internal::StartFinished { epoch, result });
        });

        self.starting = Some(Starting { task, reply });
    }

    async fn stop(&mut self) {
        let state = self.state_tx.borrow().clone();
        if state.is_down() {
            debug!("Stop ignored, session already down");
            return;
        }

        info!("Stopping session ({})", state);
        self.teardown().await;
        self.set_state(SessionState::Down);
        self.set_status(SessionStatus::Idle);
    }

    /// Release everything a session holds. Leaves the state value alone.
    async fn teardown(&mut self) {
        self.epoch += 1;

        if let Some(starting) = self.starting.take() {
            starting.task.abort();
            let _ = starting.reply.send(Err(SessionError::Cancelled));
        }

        self.underlay = None;
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        self.last_underlay = None;
        self.current.set(None);
        self.applied = None;
        self.pending_apply = None;

        self.retry.clear();
        self.probe_timer.cancel();
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        self.clock.clear();

        let deadline = self.settings.stop_timeout();
        if tokio::time::timeout(deadline, self.engine.stop()).await.is_err() {
            warn!("Engine stop exceeded {:?}, abandoning it", deadline);
        }
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::StartFinished { epoch, result } => self.on_start_finished(epoch, result).await,
            Internal::RetryDue { ticket } => self.on_retry_due(ticket).await,
            Internal::ProbeDue { ticket, reason, expected } => self.on_probe_due(ticket, reason, expected),
            Internal::ProbeFinished { epoch, run, outcome } => {
                if epoch != self.epoch || run != self.probe_run || !self.is_up() {
                    return;
                }
                self.probe_task = None;
                info!("Failover probe finished: {}", outcome.status());
                self.set_status(outcome.status());
            }
        }
    }

    async fn on_start_finished(&mut self, epoch: u64, result: Result<(), EngineError>) {
        if epoch != self.epoch {
            return;
        }
        let Some(starting) = self.starting.take() else {
            return;
        };

        match result {
            Ok(()) => {
                info!("Session up");
                self.set_state(SessionState::Up);
                self.set_status(SessionStatus::Connected);

                let target = self.pending_apply.take().or(self.current.get());
                self.apply_underlying(target).await;

                // Anything observed while connecting counts as fresh
                if let Some(cur) = self.last_underlay.clone() {
                    if let Some(status) = policy::underlay_status(None, &cur) {
                        self.set_status(status);
                    }
                    self.maybe_schedule_probe(None, &cur);
                }

                let _ = starting.reply.send(Ok(()));
            }
            Err(e) => {
                error!("Session start failed: {}", e);
                self.teardown().await;

                let message = e.to_string();
                self.set_state(SessionState::Error(message.clone()));
                self.set_status(SessionStatus::Failed(message));
                let _ = starting.reply.send(Err(SessionError::Start(e)));
            }
        }
    }

    async fn on_underlay(&mut self, cur: UnderlayState) {
        let prev = self.last_underlay.replace(cur.clone());
        self.current.set(cur.network);

        let state = self.state_tx.borrow().clone();
        match state {
            SessionState::Up => {
                self.apply_underlying(cur.network).await;
                if let Some(status) = policy::underlay_status(prev.as_ref(), &cur) {
                    self.set_status(status);
                }
                self.maybe_reset(prev.as_ref(), &cur).await;
                self.maybe_schedule_probe(prev.as_ref(), &cur);
            }
            SessionState::Connecting => {
                self.pending_apply = cur.network;
            }
            SessionState::Down | SessionState::Error(_) => {}
        }
    }

    async fn apply_underlying(&mut self, target: Option<NetworkId>) {
        if !self.is_up() || self.applied == target {
            return;
        }

        match self.engine.bind_underlying(target).await {
            Ok(()) => {
                debug!("Underlying network bound to {}", describe(target));
                self.applied = target;
                self.retry.clear();
            }
            Err(e) => {
                warn!("Failed to bind underlying network {}: {}", describe(target), e);
                if self.retry.scheduled && self.retry.target == target {
                    return;
                }
                self.retry.target = target;
                self.retry.scheduled = true;
                self.retry
                    .timer
                    .schedule(self.settings.rebind_retry(), &self.internal_tx, |ticket| Internal::RetryDue {
                        ticket,
                    });
            }
        }
    }

    async fn on_retry_due(&mut self, ticket: u64) {
        if !self.retry.timer.fire(ticket) {
            return;
        }
        let target = self.retry.target;
        self.retry.scheduled = false;

        if !self.is_up() || self.current.get() != target || self.applied == target {
            debug!("Rebind retry for {} no longer needed", describe(target));
            return;
        }

        match self.engine.bind_underlying(target).await {
            Ok(()) => {
                debug!("Underlying network bound to {} on retry", describe(target));
                self.applied = target;
            }
            Err(e) => {
                // Next attempt only comes with the next network change
                warn!("Rebind retry for {} failed: {}", describe(target), e);
            }
        }
    }

    async fn maybe_reset(&mut self, prev: Option<&UnderlayState>, cur: &UnderlayState) {
        let Some(trigger) = policy::reset_trigger(prev, cur) else {
            return;
        };
        if !self.clock.try_reset(trigger.min_interval(&self.settings)) {
            debug!("Socket reset throttled ({})", trigger);
            return;
        }

        if self.engine.reset_network().await {
            debug!("Engine sockets reset ({})", trigger);
        } else {
            debug!("Engine declined socket reset ({})", trigger);
        }
    }

    fn maybe_schedule_probe(&mut self, prev: Option<&UnderlayState>, cur: &UnderlayState) {
        if !self.is_up() {
            return;
        }
        let Some(reason) = policy::failover_trigger(prev, cur) else {
            return;
        };
        let Some(expected) = cur.network else {
            return;
        };

        debug!("Failover probe scheduled ({})", reason);
        self.probe_timer
            .schedule(self.settings.probe_debounce(), &self.internal_tx, move |ticket| Internal::ProbeDue {
                ticket,
                reason,
                expected,
            });
    }

    fn on_probe_due(&mut self, ticket: u64, reason: ProbeReason, expected: NetworkId) {
        if !self.probe_timer.fire(ticket) || !self.is_up() {
            return;
        }
        if self.current.get() != Some(expected) {
            debug!("Network moved on since probe was scheduled, skipping");
            return;
        }
        if !self.last_underlay.as_ref().is_some_and(UnderlayState::is_usable) {
            return;
        }
        if !self.clock.try_probe(self.settings.probe_min_interval()) {
            debug!("Failover probe throttled ({})", reason);
            return;
        }

        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        self.probe_run += 1;

        let prober = FailoverProbe {
            engine: self.engine.clone(),
            group: self.settings.failover_group.clone(),
            timeout: self.settings.probe_timeout(),
            settle: self.settings.probe_settle(),
        };
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        let run = self.probe_run;
        self.probe_task = Some(tokio::spawn(async move {
            let outcome = prober.run(reason).await;
            let _ = tx.send(Internal::ProbeFinished { epoch, run, outcome });
        }));
    }

    fn is_up(&self) -> bool {
        self.state_tx.borrow().is_up()
    }

    fn set_state(&self, next: SessionState) {
        self.state_tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            info!("Session state: {} -> {}", cur, next);
            *cur = next;
            true
        });
    }

    fn set_status(&self, next: SessionStatus) {
        self.status_tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            debug!("Session status: {}", next);
            *cur = next;
            true
        });
    }
}

/// Wait for the next underlay snapshot. Never resolves without a tracker.
async fn next_underlay(rx: &mut Option<watch::Receiver<UnderlayState>>) -> Option<UnderlayState> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

fn describe(network: Option<NetworkId>) -> String {
    network.map_or_else(|| "none".to_string(), |n| n.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, fast_settings, id, link, wifi_caps, Call, MockEngine};
    use veil_network::{Capabilities, ChannelSource, RawNetworkEvent};

    fn harness_with(settings: SessionSettings) -> (Arc<MockEngine>, Arc<ChannelSource>, SessionController) {
        let engine = Arc::new(MockEngine::new());
        let source = Arc::new(ChannelSource::new());
        let controller = SessionController::spawn(engine.clone(), source.clone(), settings);
        (engine, source, controller)
    }

    fn harness() -> (Arc<MockEngine>, Arc<ChannelSource>, SessionController) {
        harness_with(fast_settings())
    }

    /// Successful binds never repeat a target back to back
    fn assert_no_repeated_binds(engine: &MockEngine) {
        let ok: Vec<_> = engine.binds().into_iter().filter(|(_, ok)| *ok).map(|(t, _)| t).collect();
        for pair in ok.windows(2) {
            assert_ne!(pair[0], pair[1], "rebound {:?} twice in a row", pair[0]);
        }
    }

    #[tokio::test]
    async fn test_fresh_connect() {
        let (engine, source, controller) = harness();
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        assert_eq!(controller.current_state(), SessionState::Up);

        eventually("secured", || controller.current_status() == SessionStatus::Secured).await;
        eventually("bound", || !engine.binds().is_empty()).await;

        assert_eq!(engine.binds(), vec![(Some(id(1)), true)]);
        assert_eq!(engine.count(|c| *c == Call::Probe), 1);
        assert_eq!(engine.count(|c| matches!(c, Call::UrlTest(_))), 0);
        assert_eq!(controller.current_network(), Some(id(1)));
        assert_eq!(engine.underlying().unwrap().get(), Some(id(1)));
    }

    #[tokio::test]
    async fn test_pending_network_applied_once_up() {
        let (engine, source, controller) = harness();
        engine.set_start_delay(Duration::from_millis(100));
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        let start = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start("{}".to_string()).await })
        };

        eventually("network seen while connecting", || controller.current_network() == Some(id(1))).await;
        assert_eq!(controller.current_state(), SessionState::Connecting);
        assert!(engine.binds().is_empty());

        start.await.unwrap().unwrap();
        assert_eq!(engine.binds(), vec![(Some(id(1)), true)]);
        // No reset for a network that was already there before the tunnel came up
        assert_eq!(engine.count(|c| *c == Call::Reset), 0);
        eventually("probed", || controller.current_status() == SessionStatus::Secured).await;
    }

    #[tokio::test]
    async fn test_handover_resets_and_reprobes() {
        let (engine, source, controller) = harness();
        engine.set_start_delay(Duration::from_millis(50));
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("first probe", || engine.count(|c| *c == Call::Probe) == 1).await;
        tokio::time::sleep(Duration::from_millis(350)).await;

        source.emit(RawNetworkEvent::Lost { network: id(1) });
        source.emit_network(id(2), wifi_caps(), link("rmnet0", "100.64.0.9"));

        eventually("rebound to cellular", || engine.binds().last() == Some(&(Some(id(2)), true))).await;
        eventually("reset", || engine.count(|c| *c == Call::Reset) == 1).await;
        eventually("second probe", || engine.count(|c| *c == Call::Probe) == 2).await;
        eventually("secured", || controller.current_status() == SessionStatus::Secured).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.count(|c| *c == Call::Probe), 2);
        assert_eq!(engine.count(|c| *c == Call::Reset), 1);
        assert_eq!(controller.current_network(), Some(id(2)));
        assert_no_repeated_binds(&engine);
    }

    #[tokio::test]
    async fn test_network_up_before_start_then_lost() {
        let (engine, source, controller) = harness();
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("secured", || controller.current_status() == SessionStatus::Secured).await;

        source.emit(RawNetworkEvent::Lost { network: id(1) });

        eventually("no network", || controller.current_status() == SessionStatus::NoNetwork).await;
        eventually("unbound", || engine.binds().last() == Some(&(None, true))).await;
        assert_eq!(controller.current_network(), None);
        assert_eq!(controller.current_state(), SessionState::Up);
        assert_eq!(engine.binds(), vec![(Some(id(1)), true), (None, true)]);
    }

    /// Flip validation off and back on, which qualifies for a probe
    fn revalidate(source: &ChannelSource, network: NetworkId) {
        source.emit(RawNetworkEvent::CapabilitiesChanged {
            network,
            capabilities: Capabilities { validated: false, ..wifi_caps() },
        });
        source.emit(RawNetworkEvent::CapabilitiesChanged { network, capabilities: wifi_caps() });
    }

    #[tokio::test]
    async fn test_probe_burst_coalesced() {
        let (engine, source, controller) = harness();
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("first probe", || engine.count(|c| *c == Call::Probe) == 1).await;
        // Clear the rate limit window
        tokio::time::sleep(Duration::from_millis(350)).await;

        for _ in 0..4 {
            revalidate(&source, id(1));
        }

        eventually("second probe", || engine.count(|c| *c == Call::Probe) == 2).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.count(|c| *c == Call::Probe), 2);
        assert_eq!(controller.current_status(), SessionStatus::Secured);
    }

    #[tokio::test]
    async fn test_probe_rate_limited() {
        let (engine, source, controller) = harness();
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("first probe", || engine.count(|c| *c == Call::Probe) == 1).await;

        // Debounce elapses well inside the minimum interval
        revalidate(&source, id(1));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.count(|c| *c == Call::Probe), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        revalidate(&source, id(1));
        eventually("probe after window", || engine.count(|c| *c == Call::Probe) == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.count(|c| *c == Call::Probe), 2);
    }

    #[tokio::test]
    async fn test_resets_share_one_throttle_clock() {
        let (engine, source, controller) = harness();
        engine.set_start_delay(Duration::from_millis(50));
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));
        controller.start("{}".to_string()).await.unwrap();

        source.emit(RawNetworkEvent::LinkPropertiesChanged { network: id(1), link: link("wlan0", "10.0.0.6") });
        eventually("link reset", || engine.count(|c| *c == Call::Reset) == 1).await;

        source.emit(RawNetworkEvent::LinkPropertiesChanged { network: id(1), link: link("wlan0", "10.0.0.7") });
        source.emit(RawNetworkEvent::LinkPropertiesChanged { network: id(1), link: link("wlan0", "10.0.0.8") });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(engine.count(|c| *c == Call::Reset), 1);

        // Past the short window, a network change may reset again
        source.emit_network(id(2), wifi_caps(), link("eth0", "192.168.1.4"));
        eventually("network reset", || engine.count(|c| *c == Call::Reset) == 2).await;
    }

    #[tokio::test]
    async fn test_rebind_retried_once() {
        let (engine, source, controller) = harness();
        engine.fail_binds(1);
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("retry", || engine.binds().len() == 2).await;

        assert_eq!(engine.binds(), vec![(Some(id(1)), false), (Some(id(1)), true)]);
        assert_eq!(controller.current_state(), SessionState::Up);
    }

    #[tokio::test]
    async fn test_failed_retry_not_rescheduled() {
        let (engine, source, controller) = harness();
        engine.fail_binds(5);
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("retry", || engine.binds().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.binds().len(), 2);
        assert_eq!(controller.current_state(), SessionState::Up);
    }

    #[tokio::test]
    async fn test_dead_route_recovers_in_place() {
        let (engine, source, controller) = harness();
        engine.push_probes([false, true]);
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("recovered", || controller.current_status() == SessionStatus::RecoveredInPlace).await;

        assert_eq!(engine.count(|c| *c == Call::UrlTest("auto".to_string())), 1);
    }

    #[tokio::test]
    async fn test_dead_route_switches() {
        let (engine, source, controller) = harness();
        engine.push_probes([false, false]);
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("switched", || controller.current_status() == SessionStatus::SwitchedToAlternative).await;

        // Group test only ever follows a failed probe
        let calls = engine.calls();
        let test_at = calls.iter().position(|c| matches!(c, Call::UrlTest(_))).unwrap();
        assert!(calls[..test_at].contains(&Call::Probe));
        assert_eq!(calls.iter().filter(|c| **c == Call::Probe).count(), 2);
    }

    #[tokio::test]
    async fn test_unvalidated_network_not_probed() {
        let (engine, source, controller) = harness();
        let caps = veil_network::Capabilities { validated: false, ..wifi_caps() };
        source.emit_network(id(1), caps, link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("unvalidated", || controller.current_status() == SessionStatus::NetworkUnvalidated).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.count(|c| *c == Call::Probe), 0);

        source.emit(RawNetworkEvent::CapabilitiesChanged { network: id(1), capabilities: wifi_caps() });
        eventually("secured", || controller.current_status() == SessionStatus::Secured).await;
    }

    #[tokio::test]
    async fn test_start_failure_reports_error_and_tears_down() {
        let (engine, source, controller) = harness();
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        let err = controller.start("invalid".to_string()).await.unwrap_err();
        assert!(matches!(err, SessionError::Start(EngineError::InvalidConfig(_))));
        assert!(controller.current_state().is_error());
        assert!(matches!(controller.current_status(), SessionStatus::Failed(_)));
        assert_eq!(engine.count(|c| *c == Call::Stop), 1);
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(controller.current_network(), None);

        // A failed session can be retried directly
        controller.start("{}".to_string()).await.unwrap();
        assert_eq!(controller.current_state(), SessionState::Up);

        controller.stop().await;
        assert_eq!(controller.current_state(), SessionState::Down);
    }

    #[tokio::test]
    async fn test_blank_config_rejected() {
        let (engine, _source, controller) = harness();

        let err = controller.start("  \n".to_string()).await.unwrap_err();

        assert!(matches!(err, SessionError::Start(EngineError::InvalidConfig(_))));
        assert_eq!(engine.count(|c| *c == Call::Start), 0);
    }

    #[tokio::test]
    async fn test_start_while_active_rejected() {
        let (engine, _source, controller) = harness();
        controller.start("{}".to_string()).await.unwrap();

        let err = controller.start("{}".to_string()).await.unwrap_err();

        assert!(matches!(err, SessionError::AlreadyActive(SessionState::Up)));
        assert_eq!(engine.count(|c| *c == Call::Start), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_work() {
        let settings = SessionSettings {
            probe_debounce_ms: 300,
            rebind_retry_ms: 300,
            ..fast_settings()
        };
        let (engine, source, controller) = harness_with(settings);
        engine.fail_binds(1);
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));

        controller.start("{}".to_string()).await.unwrap();
        eventually("failed bind", || engine.binds().len() == 1).await;

        controller.stop().await;
        assert_eq!(controller.current_state(), SessionState::Down);
        assert_eq!(controller.current_status(), SessionStatus::Idle);
        assert_eq!(controller.current_network(), None);
        assert_eq!(source.subscriber_count(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.binds().len(), 1);
        assert_eq!(engine.count(|c| *c == Call::Probe), 0);

        // Idempotent
        controller.stop().await;
        assert_eq!(engine.count(|c| *c == Call::Stop), 1);
    }

    #[tokio::test]
    async fn test_stop_during_connect() {
        let (engine, _source, controller) = harness();
        engine.set_start_delay(Duration::from_secs(10));

        let start = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start("{}".to_string()).await })
        };
        eventually("connecting", || controller.current_state().is_connecting()).await;

        controller.stop().await;

        let err = start.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(controller.current_state(), SessionState::Down);
        assert_eq!(engine.count(|c| *c == Call::Stop), 1);
    }

    #[tokio::test]
    async fn test_stop_is_bounded() {
        let (engine, _source, controller) = harness();
        engine.set_stop_delay(Duration::from_secs(30));
        controller.start("{}".to_string()).await.unwrap();

        let began = tokio::time::Instant::now();
        controller.stop().await;

        assert!(began.elapsed() < Duration::from_secs(2));
        assert_eq!(controller.current_state(), SessionState::Down);
    }

    #[tokio::test]
    async fn test_subscription_failure_is_not_fatal() {
        let (engine, source, controller) = harness();
        source.emit_network(id(1), wifi_caps(), link("wlan0", "10.0.0.5"));
        source.refuse_subscriptions(true);

        controller.start("{}".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(controller.current_state(), SessionState::Up);
        assert_eq!(controller.current_network(), None);
        assert!(engine.binds().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_controller() {
        let (engine, _source, controller) = harness();
        controller.start("{}".to_string()).await.unwrap();

        controller.shutdown().await;

        assert_eq!(engine.count(|c| *c == Call::Stop), 1);
        assert!(matches!(controller.start("{}".to_string()).await, Err(SessionError::Closed)));
    }
}
