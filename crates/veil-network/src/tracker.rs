//! Network State Tracker
//!
//! Turns the raw, noisy stream of OS network callbacks into a deduplicated
//! stream of [`UnderlayState`] snapshots.
//!
//! All callback handling runs on one dedicated `underlay-tracker` thread.
//! Snapshots are published through a `tokio::sync::watch` channel, so any
//! number of async or sync readers can observe the latest value and new
//! subscribers immediately see the last published state.

use crate::source::{EventSink, NetworkRequest, NetworkSource, RawNetworkEvent, SubscriptionId};
use crate::underlay::{Capabilities, LinkProperties, NetworkId, UnderlayState};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Input of the callback thread
#[derive(Debug)]
pub(crate) enum TrackerInput {
    /// Initial network known to the system when tracking started
    Seed(Option<NetworkId>),
    /// Raw OS callback
    Event(RawNetworkEvent),
    /// Stop the thread
    Shutdown,
}

/// Publishing side shared by the tracker handle and its callback thread
struct Shared {
    /// Serializes publishes against `stop()`
    publish_lock: Mutex<()>,
    state_tx: watch::Sender<UnderlayState>,
}

impl Shared {
    /// Recompute and publish on behalf of one callback-thread run.
    ///
    /// Ignored once `live` has been cleared: callbacks that arrive after
    /// `stop()` must not resurrect a network.
    fn publish(
        &self,
        live: &AtomicBool,
        source: &dyn NetworkSource,
        network: Option<NetworkId>,
        caps: Option<Capabilities>,
        link: Option<LinkProperties>,
        reason: &str,
    ) -> bool {
        let _guard = lock(&self.publish_lock);
        if !live.load(Ordering::Acquire) {
            debug!("Ignoring trailing callback ({})", reason);
            return false;
        }

        let next = match network {
            None => UnderlayState::absent(),
            Some(id) => match caps.or_else(|| source.capabilities(id)) {
                None => {
                    debug!("No capabilities for {} ({})", id, reason);
                    UnderlayState::absent()
                }
                Some(caps) => {
                    if caps.vpn_transport {
                        debug!("{} is a VPN network, treating as absent ({})", id, reason);
                    }
                    let link = link.or_else(|| source.link_properties(id));
                    UnderlayState::observe(id, &caps, link.as_ref())
                }
            },
        };

        self.replace(next, reason)
    }

    /// Publish `absent` unconditionally (stop / registration failure)
    fn publish_absent(&self, reason: &str) -> bool {
        let _guard = lock(&self.publish_lock);
        self.replace(UnderlayState::absent(), reason)
    }

    /// Hand `next` downstream only if it differs from the last published value
    fn replace(&self, next: UnderlayState, reason: &str) -> bool {
        self.state_tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            debug!("Underlay state changed: {} -> {} ({})", cur, next, reason);
            *cur = next;
            true
        })
    }
}

/// One started tracking session
struct Running {
    input: Sender<TrackerInput>,
    subscription: SubscriptionId,
    live: Arc<AtomicBool>,
}

/// Observes the best network satisfying {internet, not restricted}
///
/// # Usage
///
/// ```rust,ignore
/// let tracker = NetworkTracker::new(source);
/// let mut rx = tracker.subscribe();
/// tracker.start();
///
/// while rx.changed().await.is_ok() {
///     let underlay = rx.borrow_and_update().clone();
///     // react to underlay
/// }
///
/// tracker.stop();
/// ```
pub struct NetworkTracker {
    source: Arc<dyn NetworkSource>,
    request: NetworkRequest,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl NetworkTracker {
    /// Create a tracker over `source` with the default request
    pub fn new(source: Arc<dyn NetworkSource>) -> Self {
        Self::with_request(source, NetworkRequest::default())
    }

    /// Create a tracker with a custom capability filter
    pub fn with_request(source: Arc<dyn NetworkSource>, request: NetworkRequest) -> Self {
        let (state_tx, _) = watch::channel(UnderlayState::absent());
        Self {
            source,
            request,
            shared: Arc::new(Shared {
                publish_lock: Mutex::new(()),
                state_tx,
            }),
            running: Mutex::new(None),
        }
    }

    /// Subscribe to published snapshots
    pub fn subscribe(&self) -> watch::Receiver<UnderlayState> {
        self.shared.state_tx.subscribe()
    }

    /// Last published snapshot
    pub fn current(&self) -> UnderlayState {
        self.shared.state_tx.borrow().clone()
    }

    /// Is a subscription currently active?
    pub fn is_started(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Begin observing. Idempotent.
    ///
    /// A subscription failure is not fatal: the tracker publishes an absent
    /// state and stays inert.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }

        let (tx, rx) = unbounded();
        // Live before registering, so a callback fired during registration is kept
        let live = Arc::new(AtomicBool::new(true));

        let spawned = spawn_callback_thread(self.source.clone(), self.shared.clone(), live.clone(), rx);
        if let Err(e) = spawned {
            warn!("Failed to spawn underlay tracker thread: {}", e);
            live.store(false, Ordering::Release);
            self.shared.publish_absent("spawn-failed");
            return;
        }

        match self.source.subscribe(&self.request, EventSink::new(tx.clone())) {
            Ok(subscription) => {
                let _ = tx.send(TrackerInput::Seed(self.source.active_network()));
                info!("Underlay tracker started");
                *running = Some(Running {
                    input: tx,
                    subscription,
                    live,
                });
            }
            Err(e) => {
                warn!("Network subscription failed, underlay unavailable: {}", e);
                {
                    let _guard = lock(&self.shared.publish_lock);
                    live.store(false, Ordering::Release);
                }
                self.shared.publish_absent("register-failed");
                let _ = tx.send(TrackerInput::Shutdown);
            }
        }
    }

    /// Stop observing and publish an absent state. Idempotent.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };

        self.source.unsubscribe(running.subscription);
        {
            let _guard = lock(&self.shared.publish_lock);
            running.live.store(false, Ordering::Release);
        }
        self.shared.publish_absent("stop");
        let _ = running.input.send(TrackerInput::Shutdown);

        info!("Underlay tracker stopped");
    }
}

impl Drop for NetworkTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_callback_thread(
    source: Arc<dyn NetworkSource>,
    shared: Arc<Shared>,
    live: Arc<AtomicBool>,
    rx: Receiver<TrackerInput>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("underlay-tracker".to_string())
        .spawn(move || {
            debug!("Underlay callback thread started");
            run_callback_loop(source.as_ref(), &shared, &live, rx);
            debug!("Underlay callback thread stopped");
        })
}

fn run_callback_loop(source: &dyn NetworkSource, shared: &Shared, live: &AtomicBool, rx: Receiver<TrackerInput>) {
    // Network the system currently reports as best matching
    let mut current: Option<NetworkId> = None;

    while let Ok(input) = rx.recv() {
        match input {
            TrackerInput::Shutdown => break,
            TrackerInput::Seed(network) => {
                // Sources need not replay `Available` for a network that was up before subscribing
                current = network;
                let reason = if network.is_some() { "start-active" } else { "start" };
                shared.publish(live, source, network, None, None, reason);
            }
            TrackerInput::Event(event) => handle_event(source, shared, live, &mut current, event),
        }
    }
}

fn handle_event(
    source: &dyn NetworkSource,
    shared: &Shared,
    live: &AtomicBool,
    current: &mut Option<NetworkId>,
    event: RawNetworkEvent,
) {
    let reason = event.kind();
    match event {
        RawNetworkEvent::Available { network } => {
            *current = Some(network);
            shared.publish(live, source, Some(network), None, None, reason);
        }
        RawNetworkEvent::Lost { network } => {
            if *current == Some(network) {
                *current = None;
                shared.publish(live, source, None, None, None, reason);
            }
        }
        RawNetworkEvent::Unavailable => {
            *current = None;
            shared.publish(live, source, None, None, None, reason);
        }
        RawNetworkEvent::CapabilitiesChanged { network, capabilities } => {
            if current.is_none() || *current == Some(network) {
                *current = Some(network);
                shared.publish(live, source, Some(network), Some(capabilities), None, reason);
            }
        }
        RawNetworkEvent::LinkPropertiesChanged { network, link } => {
            if current.is_none() || *current == Some(network) {
                *current = Some(network);
                shared.publish(live, source, Some(network), None, Some(link), reason);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
