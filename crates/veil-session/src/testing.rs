//! Scripted engine and helpers shared by the controller and facade tests

use crate::engine::{CurrentNetwork, EngineError, TunnelEngine};
use crate::settings::SessionSettings;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use veil_network::{Capabilities, LinkAddress, LinkProperties, NetworkId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Start,
    Stop,
    /// Target and whether the bind succeeded
    Bind(Option<NetworkId>, bool),
    Reset,
    UrlTest(String),
    Probe,
}

#[derive(Default)]
struct Script {
    start_delay: Duration,
    start_error: Option<EngineError>,
    stop_delay: Duration,
    bind_failures: usize,
    probes: VecDeque<bool>,
    probe_hang: bool,
}

#[derive(Default)]
pub(crate) struct MockEngine {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    underlying: Mutex<Option<CurrentNetwork>>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_start_delay(&self, delay: Duration) {
        self.script.lock().unwrap().start_delay = delay;
    }

    pub(crate) fn fail_start(&self, error: EngineError) {
        self.script.lock().unwrap().start_error = Some(error);
    }

    pub(crate) fn set_stop_delay(&self, delay: Duration) {
        self.script.lock().unwrap().stop_delay = delay;
    }

    /// Fail the next `n` binds
    pub(crate) fn fail_binds(&self, n: usize) {
        self.script.lock().unwrap().bind_failures = n;
    }

    /// Queue probe results; an empty queue answers alive
    pub(crate) fn push_probes(&self, results: impl IntoIterator<Item = bool>) {
        self.script.lock().unwrap().probes.extend(results);
    }

    pub(crate) fn set_probe_hang(&self, hang: bool) {
        self.script.lock().unwrap().probe_hang = hang;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub(crate) fn binds(&self) -> Vec<(Option<NetworkId>, bool)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Bind(target, ok) => Some((*target, *ok)),
                _ => None,
            })
            .collect()
    }

    /// Handle passed to the last `start`
    pub(crate) fn underlying(&self) -> Option<CurrentNetwork> {
        self.underlying.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TunnelEngine for MockEngine {
    async fn start(&self, config: &str, underlying: CurrentNetwork) -> Result<(), EngineError> {
        self.record(Call::Start);
        *self.underlying.lock().unwrap() = Some(underlying);

        let (delay, error) = {
            let script = self.script.lock().unwrap();
            (script.start_delay, script.start_error.clone())
        };
        tokio::time::sleep(delay).await;

        if config.contains("invalid") {
            return Err(EngineError::InvalidConfig("unparseable".into()));
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop(&self) {
        self.record(Call::Stop);
        let delay = self.script.lock().unwrap().stop_delay;
        tokio::time::sleep(delay).await;
    }

    async fn reset_network(&self) -> bool {
        self.record(Call::Reset);
        true
    }

    fn url_test(&self, group: &str) {
        self.record(Call::UrlTest(group.to_string()));
    }

    async fn bind_underlying(&self, network: Option<NetworkId>) -> Result<(), EngineError> {
        let ok = {
            let mut script = self.script.lock().unwrap();
            if script.bind_failures > 0 {
                script.bind_failures -= 1;
                false
            } else {
                true
            }
        };
        self.record(Call::Bind(network, ok));
        if ok {
            Ok(())
        } else {
            Err(EngineError::Bind("EPERM".into()))
        }
    }

    async fn probe(&self) -> Result<(), EngineError> {
        self.record(Call::Probe);
        let (hang, alive) = {
            let mut script = self.script.lock().unwrap();
            (script.probe_hang, script.probes.pop_front().unwrap_or(true))
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if alive {
            Ok(())
        } else {
            Err(EngineError::Probe("connection refused".into()))
        }
    }
}

/// Short timings so real-time tests stay fast
pub(crate) fn fast_settings() -> SessionSettings {
    SessionSettings {
        rebind_retry_ms: 60,
        reset_on_network_change_ms: 200,
        reset_on_link_change_ms: 2_000,
        probe_debounce_ms: 40,
        probe_min_interval_ms: 300,
        probe_timeout_ms: 100,
        probe_settle_ms: 50,
        failover_group: "auto".to_string(),
        stop_timeout_ms: 300,
    }
}

pub(crate) fn id(n: u64) -> NetworkId {
    NetworkId::new(n).unwrap()
}

pub(crate) fn link(iface: &str, addr: &str) -> LinkProperties {
    LinkProperties {
        interface_name: Some(iface.into()),
        addresses: vec![LinkAddress { address: addr.parse().unwrap(), prefix_len: 24 }],
        ..Default::default()
    }
}

pub(crate) fn wifi_caps() -> Capabilities {
    Capabilities::validated_internet()
}

/// Poll `f` until it holds, panicking after 3 seconds
pub(crate) async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !f() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
