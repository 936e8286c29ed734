// Two routers on a loopback link, driven step by step
//
// Simulated time comes from a ManualClock advanced one tick per step; tokio
// only paces the steps so a human can follow the log.

use anyhow::{bail, Result};
use pakbus_core::{
    Clock, EchoOutcome, LoopbackLink, LoopbackPort, LoopbackSettings, ManualClock, NodeAddress, Priority,
    Router, TranClient, TranKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;

/// Forwards echo outcomes to the simulation loop
struct EchoSink {
    tx: mpsc::UnboundedSender<(TranKey, EchoOutcome)>,
}

impl TranClient<EchoOutcome> for EchoSink {
    fn on_complete(&self, key: TranKey, outcome: EchoOutcome) {
        let _ = self.tx.send((key, outcome));
    }
}

pub struct Simulation {
    clock: Arc<ManualClock>,
    a: Router,
    b: Router,
    link: LoopbackLink,
    // routers hold their ports weakly
    _ports: (Arc<LoopbackPort>, Arc<LoopbackPort>),
    tick_msec: u64,
    pace: Duration,
    max_steps: u32,
}

impl Simulation {
    pub fn new(config: &Config) -> Result<Self> {
        let sim = &config.sim;
        if sim.node_a == sim.node_b {
            bail!("Both routers would be node {}", sim.node_a);
        }
        let clock = Arc::new(ManualClock::new(0));
        let mut a = Router::new(config.router_for(sim.node_a)?, clock.clone())?;
        let mut b = Router::new(config.router_for(sim.node_b)?, clock.clone())?;

        let port = |name: &str| {
            LoopbackPort::new(LoopbackSettings {
                name: name.to_string(),
                worst_case_response_msec: sim.worst_case_response_msec,
                beacon_interval_sec: 60,
                ..LoopbackSettings::default()
            })
        };
        let port_a = port("sim-a");
        let port_b = port("sim-b");
        let link = LoopbackLink::connect(&mut a, &port_a, &mut b, &port_b);

        Ok(Self {
            clock,
            a,
            b,
            link,
            _ports: (port_a, port_b),
            tick_msec: sim.tick_msec.max(1),
            pace: Duration::from_millis(sim.pace_msec),
            max_steps: sim.max_steps,
        })
    }

    pub fn now(&self) -> u64 {
        self.clock.now_msec()
    }

    pub fn router_a(&self) -> &Router {
        &self.a
    }

    /// Advance one tick, run both routers and carry their traffic
    async fn step(&mut self) {
        self.clock.advance(self.tick_msec);
        self.a.poll();
        self.b.poll();
        let moved = self.link.pump(&mut self.a, &mut self.b);
        if moved > 0 {
            debug!("t={}ms: {} packets", self.clock.now_msec(), moved);
        }
        if !self.pace.is_zero() {
            tokio::time::sleep(self.pace).await;
        }
    }

    fn knows(router: &Router, address: NodeAddress) -> bool {
        router
            .topology()
            .neighbour(address)
            .map_or(false, |n| n.is_settled())
    }

    /// Run until both routers have settled each other. Returns the simulated
    /// time it took.
    pub async fn discover(&mut self) -> Result<u64> {
        let (node_a, node_b) = (self.a.this_node(), self.b.this_node());
        let started = self.now();
        for _ in 0..self.max_steps {
            if Self::knows(&self.a, node_b) && Self::knows(&self.b, node_a) {
                info!("Nodes {} and {} settled", node_a, node_b);
                return Ok(self.now() - started);
            }
            self.step().await;
        }
        bail!("Nodes {} and {} never settled", node_a, node_b)
    }

    /// One echo from A to B
    pub async fn echo(&mut self, packet_size: usize) -> Result<EchoOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(EchoSink { tx });
        let destination = self.b.this_node();
        let key = self
            .a
            .open_echo(destination, packet_size, Priority::Normal, &sink)?;
        for _ in 0..self.max_steps {
            if let Ok((done, outcome)) = rx.try_recv() {
                debug_assert_eq!(done, key);
                return Ok(outcome);
            }
            self.step().await;
        }
        self.a.cancel_transaction(key);
        bail!("Echo {} did not finish in {} steps", key, self.max_steps)
    }
}
