// Focus arbitration and the router-sponsored transaction slot

use std::cmp::Reverse;
use tracing::{debug, warn};

use super::{FocusRequest, Router, RouterEvent, TranSlot};
use crate::message::{NodeAddress, Priority};
use crate::routing::Neighbour;
use crate::tran::{GetNeighboursTran, HelloTran, SendNeighboursTran, TranKey, TranKind};

impl Router {
    /// Queue a transaction for focus. Higher priority first, then arrival order.
    pub(crate) fn request_focus(&mut self, key: TranKey, priority: Priority) {
        if self.focus == Some(key) || self.waiting.iter().any(|r| r.key == key) {
            return;
        }
        let seq = self.next_focus_seq;
        self.next_focus_seq += 1;
        let pos = self
            .waiting
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(pos, FocusRequest { key, priority, seq });
    }

    /// First-hop neighbour used to reach `destination`
    pub(crate) fn neighbour_for(&self, destination: NodeAddress) -> Option<&Neighbour> {
        match self.resolve_route(destination) {
            Some(route) => self.topology.neighbour(route.neighbour_id),
            None => self.topology.neighbour(destination),
        }
    }

    /// True if the link toward `destination` is dialed and already carries
    /// a conversation with it
    fn has_dialed_session(&self, destination: NodeAddress) -> bool {
        let Some(route) = self.resolve_route(destination) else {
            return false;
        };
        self.port(route.port).map_or(false, |port| {
            port.link_is_dialed() && port.has_session(self.this_node(), destination)
        })
    }

    /// Hand focus to the next eligible waiting transaction.
    ///
    /// A transaction whose first hop still owes a hello is held back once
    /// while a hello runs ahead of it.
    pub(crate) fn set_next_transaction_focus(&mut self) {
        if self.focus.is_some() {
            return;
        }
        self.waiting.retain(|r| self.transactions.contains_key(&r.key));
        if self.waiting.is_empty() {
            return;
        }

        let mut order: Vec<FocusRequest> = self.waiting.clone();
        order.sort_by_key(|r| (!self.has_dialed_session(r.key.destination), Reverse(r.priority), r.seq));

        for request in order {
            let key = request.key;
            let pending_hello = self
                .neighbour_for(key.destination)
                .filter(|n| !n.is_settled())
                .map(|n| n.address);

            if let Some(neighbour) = pending_hello {
                if self.router_tran.map(|k| k.destination) == Some(neighbour) {
                    continue;
                }
                let preempted = match self.transactions.get(&key) {
                    Some(TranSlot::Ready(tran)) => tran.core.preempted,
                    _ => true,
                };
                if !preempted {
                    self.preempt_for_hello(neighbour);
                    match self.router_tran {
                        Some(current) if current.destination == neighbour => {
                            debug!("Transaction {} waits for a hello to {}", key, neighbour);
                            self.mark_preempted(key);
                            continue;
                        }
                        Some(_) => continue,
                        None => self.mark_preempted(key),
                    }
                }
            }

            self.waiting.retain(|r| r.key != key);
            self.focus = Some(key);
            debug!("Transaction {} has focus", key);
            self.events.push_back(RouterEvent::FocusStart(key));
            return;
        }
    }

    fn mark_preempted(&mut self, key: TranKey) {
        if let Some(TranSlot::Ready(tran)) = self.transactions.get_mut(&key) {
            tran.core.preempted = true;
        }
    }

    fn preempt_for_hello(&mut self, neighbour: NodeAddress) {
        let now = self.now();
        if let Some(n) = self.topology.neighbour_mut(neighbour) {
            n.force_hello(now);
        }
        let behind: Vec<NodeAddress> = self
            .topology
            .routes()
            .filter(|route| route.neighbour_id == neighbour)
            .map(|route| route.destination)
            .collect();
        for address in behind {
            if let Some(record) = self.topology.router_mut(address) {
                record.validated = false;
                record.get_all = true;
                record.postpone(now, 0);
            }
        }
        self.do_next_router_transaction();
    }

    /// Start the next hello or neighbour list exchange if the slot is free
    pub(crate) fn do_next_router_transaction(&mut self) {
        if self.router_tran.is_some() {
            return;
        }
        let now = self.now();

        let hello = self
            .topology
            .neighbours()
            .filter(|n| n.hello_due(now))
            .min_by_key(|n| (n.hello_tries, n.address))
            .map(|n| n.address);
        if let Some(neighbour) = hello {
            self.open_router_transaction(neighbour, TranKind::Hello(HelloTran::new(neighbour)));
            return;
        }

        if self.config.is_leaf_node {
            return;
        }
        let sync = self
            .topology
            .routers()
            .filter(|r| r.needs_sync() && self.resolve_route(r.address).is_some())
            .filter_map(|r| r.retry_overdue(now).map(|overdue| (overdue, r.address, r.get_all)))
            .max_by_key(|(overdue, address, _)| (*overdue, Reverse(*address)));
        if let Some((_, address, get_all)) = sync {
            let kind = if get_all {
                TranKind::GetNeighbours(GetNeighboursTran::new(address))
            } else {
                TranKind::SendNeighbours(SendNeighboursTran::new(address))
            };
            self.open_router_transaction(address, kind);
        }
    }

    fn open_router_transaction(&mut self, destination: NodeAddress, kind: TranKind) {
        let name = kind.name();
        if let Err(e) = self.open_transaction(destination, Priority::High, kind, true) {
            warn!("Could not start {} with {}: {}", name, destination, e);
        }
    }
}
