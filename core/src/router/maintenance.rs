// Timers and periodic housekeeping
//
// `poll` is the router's only clock input. The maintenance tick keeps the
// focus holder honest, sweeps the unrouted queue, verifies neighbours,
// sends beacons and starts router-sponsored work.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::{QueuedMessage, Router, RouterEvent, RouterStats, TimerClient, TranSlot};
use crate::message::{message_types, ExpectMore, FailureCode, Message, NodeAddress, Priority, BROADCAST_ADDRESS};
use crate::routing::{Link, Neighbour, Route, RouterRecord};
use crate::tran::{TranKey, TranState, TranTimer};
use crate::transport::PortId;

/// One transaction as seen by a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TranSummary {
    pub key: TranKey,
    pub kind: String,
    pub state: Option<TranState>,
    pub priority: Option<Priority>,
    pub report_id: u64,
}

/// Point-in-time view of the router for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub this_node: NodeAddress,
    pub is_leaf_node: bool,
    pub taken_at: u64,
    pub ports: Vec<(PortId, String)>,
    pub neighbours: Vec<Neighbour>,
    pub routers: Vec<RouterRecord>,
    pub links: Vec<Link>,
    pub routes: Vec<Route>,
    pub static_routes: Vec<Route>,
    pub transactions: Vec<TranSummary>,
    pub focus: Option<TranKey>,
    pub waiting: Vec<TranKey>,
    pub router_transaction: Option<TranKey>,
    pub queued_messages: usize,
    pub stats: RouterStats,
}

impl Router {
    /// Run every timer that is due and return the next deadline
    pub fn poll(&mut self) -> Option<u64> {
        let now = self.now();
        for (id, client) in self.timers.expired(now) {
            match client {
                TimerClient::Maintenance => {
                    self.maintenance_timer = 0;
                    self.on_maintenance();
                }
                TimerClient::Tran(key, timer) => {
                    self.events.push_back(RouterEvent::TranTimer(key, timer, id));
                }
            }
        }
        self.pump_events();
        self.timers.next_deadline()
    }

    fn on_maintenance(&mut self) {
        let now = self.now();
        self.check_focus_route(now);
        self.sweep_stuck_transactions();
        self.sweep_unrouted(now);
        self.verify_neighbours(now);
        self.send_beacons(now);
        self.kick_ports(now);
        self.do_next_router_transaction();
        self.set_next_transaction_focus();

        if now.saturating_sub(self.last_snapshot) >= self.config.debug_snapshot_interval_msec as u64 {
            self.last_snapshot = now;
            match serde_json::to_string(&self.snapshot()) {
                Ok(json) => debug!("Router snapshot: {}", json),
                Err(e) => warn!("Router snapshot failed: {}", e),
            }
        }

        self.maintenance_timer =
            self.timers
                .arm(TimerClient::Maintenance, now, self.config.maintenance_interval_msec);
    }

    /// The focus holder gets a grace period once its destination becomes unreachable
    fn check_focus_route(&mut self, now: u64) {
        let Some(key) = self.focus else {
            return;
        };
        let routable = key.destination == self.this_node()
            || self.resolve_route(key.destination).is_some()
            || self.topology.neighbour(key.destination).is_some();
        let grace = self.config.unroutable_grace_msec;
        let Some(TranSlot::Ready(tran)) = self.transactions.get_mut(&key) else {
            return;
        };
        if routable {
            self.timers.disarm(&mut tran.core.unroutable_timer);
        } else if tran.core.unroutable_timer == 0 {
            debug!("No route for focus holder {}", key);
            tran.core.unroutable_timer =
                self.timers
                    .arm(TimerClient::Tran(key, TranTimer::Unroutable), now, grace);
        }
    }

    /// Fail transactions that sent something and have nothing left to wake them
    fn sweep_stuck_transactions(&mut self) {
        let stuck: Vec<TranKey> = self
            .transactions
            .iter()
            .filter_map(|(key, slot)| match slot {
                TranSlot::Ready(tran) if !tran.core.is_closing() && !tran.core.is_still_valid() => Some(*key),
                _ => None,
            })
            .collect();
        for key in stuck {
            warn!("Transaction {} is stuck", key);
            self.events
                .push_back(RouterEvent::TranFailure(key, FailureCode::TimedOutOrResourceError));
        }
    }

    /// Fail queued messages whose route vanished or that waited too long
    fn sweep_unrouted(&mut self, now: u64) {
        let max_age = self.config.unrouted_max_age_msec as u64;
        let mut failed: Vec<(QueuedMessage, FailureCode)> = Vec::new();
        let mut kept = Vec::with_capacity(self.unrouted.len());
        for queued in std::mem::take(&mut self.unrouted) {
            let port = self.port(queued.port);
            let routed = queued.message.own_route.is_some()
                || self.resolve_route(queued.message.destination).is_some();
            let aged = now.saturating_sub(queued.queued_at) > max_age
                && port
                    .as_ref()
                    .map_or(false, |p| p.link_is_active() && !p.should_cap_timeout());
            if port.is_none() || !routed {
                failed.push((queued, FailureCode::UnreachableDestination));
            } else if aged {
                failed.push((queued, FailureCode::TimedOutOrResourceError));
            } else {
                kept.push(queued);
            }
        }
        self.unrouted = kept;
        for (queued, code) in failed {
            debug!("Unrouted {} failed: {}", queued.message, code);
            self.fail_queued(queued, code);
        }
    }

    fn verify_neighbours(&mut self, now: u64) {
        let expired: Vec<NodeAddress> = self
            .topology
            .neighbours()
            .filter(|n| n.is_settled() && n.verification_expired(now))
            .map(|n| n.address)
            .collect();
        for address in expired {
            debug!("Neighbour {} silent, verifying", address);
            if let Some(neighbour) = self.topology.neighbour_mut(address) {
                neighbour.force_hello(now);
            }
        }
    }

    /// Broadcast a hello request on every port whose beacon interval elapsed
    fn send_beacons(&mut self, now: u64) {
        let this_node = self.this_node();
        let due: Vec<PortId> = self
            .ports
            .iter()
            .filter_map(|(id, entry)| {
                let port = entry.port.upgrade()?;
                let interval = port.beacon_interval() as u64 * 1000;
                let due = interval > 0
                    && entry
                        .last_beacon
                        .map_or(true, |last| now.saturating_sub(last) >= interval);
                due.then_some(*id)
            })
            .collect();
        for id in due {
            let Some(port) = self.port(id) else {
                continue;
            };
            let mut beacon = Message::pakctrl(message_types::HELLO_REQUEST, 0, &[]);
            beacon.source = this_node;
            beacon.destination = BROADCAST_ADDRESS;
            beacon.physical_source = this_node;
            beacon.physical_destination = BROADCAST_ADDRESS;
            beacon.expect_more = ExpectMore::Last;
            beacon.should_encrypt = false;
            port.broadcast_message(&beacon);
            self.stats.messages_sent += 1;
            if let Some(entry) = self.ports.get_mut(&id) {
                entry.last_beacon = Some(now);
            }
        }
    }

    /// Remind ports about traffic that has sat in the queue for a whole tick
    fn kick_ports(&mut self, now: u64) {
        let interval = self.config.maintenance_interval_msec as u64;
        let mut dormant: BTreeMap<(PortId, NodeAddress), Priority> = BTreeMap::new();
        for queued in &self.unrouted {
            if now.saturating_sub(queued.queued_at) < interval {
                continue;
            }
            let priority = dormant
                .entry((queued.port, queued.physical_destination))
                .or_insert(queued.message.priority);
            *priority = (*priority).max(queued.message.priority);
        }
        for ((port_id, physical_destination), priority) in dormant {
            if let Some(port) = self.port(port_id) {
                port.on_message_ready(physical_destination, priority);
            }
        }
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let transactions = self
            .transactions
            .iter()
            .map(|(key, slot)| match slot {
                TranSlot::Ready(tran) => TranSummary {
                    key: *key,
                    kind: tran.kind.name().to_string(),
                    state: Some(tran.core.state),
                    priority: Some(tran.core.priority),
                    report_id: tran.core.report_id,
                },
                TranSlot::Busy => TranSummary {
                    key: *key,
                    kind: "busy".to_string(),
                    state: None,
                    priority: None,
                    report_id: 0,
                },
            })
            .collect();
        RouterSnapshot {
            this_node: self.this_node(),
            is_leaf_node: self.config.is_leaf_node,
            taken_at: self.now(),
            ports: self
                .ports
                .iter()
                .filter_map(|(id, entry)| entry.port.upgrade().map(|p| (*id, p.port_name())))
                .collect(),
            neighbours: self.topology.neighbours().cloned().collect(),
            routers: self.topology.routers().cloned().collect(),
            links: self.topology.links().copied().collect(),
            routes: self.topology.routes().copied().collect(),
            static_routes: self.topology.static_routes().copied().collect(),
            transactions,
            focus: self.focus,
            waiting: self.waiting_transactions(),
            router_transaction: self.router_tran,
            queued_messages: self.unrouted.len(),
            stats: self.stats,
        }
    }
}
