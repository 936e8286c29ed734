// Shared fixtures for router integration tests
//
// Routers run on a ManualClock and talk over LoopbackLinks, so every
// scenario is deterministic: time only moves when a test ticks it.

#![allow(dead_code)]

use parking_lot::Mutex;
use pakbus_core::{
    LoopbackLink, LoopbackPort, LoopbackSettings, ManualClock, NodeAddress, Router, RouterConfig,
    TranClient, TranKey,
};
use std::sync::Arc;

/// Collects transaction outcomes
pub struct Recorder<O> {
    outcomes: Mutex<Vec<(TranKey, O)>>,
}

impl<O: Clone> Recorder<O> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(Vec::new()),
        })
    }

    pub fn outcomes(&self) -> Vec<(TranKey, O)> {
        self.outcomes.lock().clone()
    }

    pub fn outcome_for(&self, key: TranKey) -> Option<O> {
        self.outcomes
            .lock()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, o)| o.clone())
    }
}

impl<O: Send> TranClient<O> for Recorder<O> {
    fn on_complete(&self, key: TranKey, outcome: O) {
        self.outcomes.lock().push((key, outcome));
    }
}

pub fn beaconing_port(name: &str, worst_case_response_msec: u32) -> Arc<LoopbackPort> {
    LoopbackPort::new(LoopbackSettings {
        name: name.to_string(),
        worst_case_response_msec,
        beacon_interval_sec: 60,
        ..LoopbackSettings::default()
    })
}

/// Route router logs to the test harness; `RUST_LOG=debug` shows traffic
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn router(clock: &Arc<ManualClock>, address: NodeAddress) -> Router {
    init_logging();
    Router::new(RouterConfig::for_node(address), clock.clone()).unwrap()
}

/// Two routers joined by one loopback link
pub struct Pair {
    pub clock: Arc<ManualClock>,
    pub a: Router,
    pub b: Router,
    pub link: LoopbackLink,
    pub port_a: Arc<LoopbackPort>,
    pub port_b: Arc<LoopbackPort>,
}

impl Pair {
    pub fn new(a: NodeAddress, b: NodeAddress, worst_case_response_msec: u32) -> Self {
        Self::with_configs(
            RouterConfig::for_node(a),
            RouterConfig::for_node(b),
            worst_case_response_msec,
        )
    }

    pub fn with_configs(config_a: RouterConfig, config_b: RouterConfig, worst_case_response_msec: u32) -> Self {
        init_logging();
        let clock = Arc::new(ManualClock::new(0));
        let mut router_a = Router::new(config_a, clock.clone()).unwrap();
        let mut router_b = Router::new(config_b, clock.clone()).unwrap();
        let port_a = beaconing_port("a", worst_case_response_msec);
        let port_b = beaconing_port("b", worst_case_response_msec);
        let link = LoopbackLink::connect(&mut router_a, &port_a, &mut router_b, &port_b);
        Self {
            clock,
            a: router_a,
            b: router_b,
            link,
            port_a,
            port_b,
        }
    }

    pub fn pump(&mut self) -> usize {
        self.link.pump(&mut self.a, &mut self.b)
    }

    pub fn tick(&mut self, msec: u64) {
        self.clock.advance(msec);
        self.a.poll();
        self.b.poll();
        self.pump();
    }

    /// Let beacons, hellos and neighbour list exchanges run their course
    pub fn settle(&mut self) {
        for _ in 0..5 {
            self.tick(1_000);
        }
    }
}

/// Three routers in a line: A - B - C
pub struct Chain {
    pub clock: Arc<ManualClock>,
    pub a: Router,
    pub b: Router,
    pub c: Router,
    pub ab: LoopbackLink,
    pub bc: LoopbackLink,
    pub ports: Vec<Arc<LoopbackPort>>,
}

impl Chain {
    pub fn new(a: NodeAddress, b: NodeAddress, c: NodeAddress) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let mut router_a = router(&clock, a);
        let mut router_b = router(&clock, b);
        let mut router_c = router(&clock, c);
        let ports = vec![
            beaconing_port("a-b", 500),
            beaconing_port("b-a", 500),
            beaconing_port("b-c", 500),
            beaconing_port("c-b", 500),
        ];
        let ab = LoopbackLink::connect(&mut router_a, &ports[0], &mut router_b, &ports[1]);
        let bc = LoopbackLink::connect(&mut router_b, &ports[2], &mut router_c, &ports[3]);
        Self {
            clock,
            a: router_a,
            b: router_b,
            c: router_c,
            ab,
            bc,
            ports,
        }
    }

    pub fn pump(&mut self) {
        for _ in 0..64 {
            let moved = self.ab.pump(&mut self.a, &mut self.b) + self.bc.pump(&mut self.b, &mut self.c);
            if moved == 0 {
                break;
            }
        }
    }

    pub fn tick(&mut self, msec: u64) {
        self.clock.advance(msec);
        self.a.poll();
        self.b.poll();
        self.c.poll();
        self.pump();
    }

    pub fn settle(&mut self) {
        for _ in 0..10 {
            self.tick(1_000);
        }
    }
}
