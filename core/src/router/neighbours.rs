// Neighbour discovery, hello outcomes and neighbour list synchronisation

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::Router;
use crate::message::{
    is_valid_node_address, FailureCode, HelloInfo, NeighbourList, NodeAddress, Priority,
};
use crate::routing::{broadcast_is_beacon, calculate_verification_interval, LinkChange, Neighbour};
use crate::transport::{Port, PortId};
use crate::PakBusError;

impl Router {
    /// A port saw a beacon from `physical_source`
    pub fn on_beacon(
        &mut self,
        port: PortId,
        physical_source: NodeAddress,
        is_broadcast: bool,
    ) -> Result<(), PakBusError> {
        if !self.ports.contains_key(&port) {
            return Err(PakBusError::PortNotRegistered(port));
        }
        self.observe_beacon(port, physical_source, is_broadcast);
        self.pump_events();
        Ok(())
    }

    /// The link behind a port failed. Everything queued on it is withdrawn.
    pub fn on_link_failure(&mut self, port: PortId) -> Result<(), PakBusError> {
        if !self.ports.contains_key(&port) {
            return Err(PakBusError::PortNotRegistered(port));
        }
        info!("Link failure on {}", port);
        self.withdraw_port_messages(port, FailureCode::UnreachableDestination);
        self.pump_events();
        Ok(())
    }

    /// The link behind a port came up; queued traffic is announced again
    pub fn on_link_ready(&mut self, port_id: PortId) -> Result<(), PakBusError> {
        let Some(port) = self.port(port_id) else {
            return Err(PakBusError::PortNotRegistered(port_id));
        };
        let mut ready: BTreeMap<NodeAddress, Priority> = BTreeMap::new();
        for queued in self.unrouted.iter().filter(|q| q.port == port_id) {
            let priority = ready
                .entry(queued.physical_destination)
                .or_insert(queued.message.priority);
            *priority = (*priority).max(queued.message.priority);
        }
        for (physical_destination, priority) in ready {
            port.on_message_ready(physical_destination, priority);
        }
        self.pump_events();
        Ok(())
    }

    pub(crate) fn observe_beacon(&mut self, port_id: PortId, source: NodeAddress, is_broadcast: bool) {
        if !is_valid_node_address(source) || source == self.this_node() {
            return;
        }
        let Some(port) = self.port(port_id) else {
            return;
        };
        let now = self.now();
        match self.topology.neighbour_mut(source) {
            Some(neighbour) => {
                if !is_broadcast
                    || broadcast_is_beacon(port.beacon_interval(), neighbour.verification_interval_msec)
                {
                    neighbour.beacon_base = now;
                }
            }
            None if port.can_accept_neighbour(source) => {
                info!("Neighbour {} beaconed on {}", source, port_id);
                self.topology
                    .insert_neighbour(Neighbour::discovered(source, port_id, port.hop_metric(), now));
                self.do_next_router_transaction();
            }
            None => debug!("{} refuses neighbour {}", port_id, source),
        }
    }

    /// What we tell a neighbour about ourselves on `port`
    pub(crate) fn local_hello_info(&self, port: &dyn Port) -> HelloInfo {
        HelloInfo {
            is_router: !self.config.is_leaf_node,
            hop_metric: port.hop_metric(),
            verify_interval: port.verify_interval(),
        }
    }

    pub(crate) fn hello_link(&self, neighbour: NodeAddress) -> Option<(PortId, Arc<dyn Port>)> {
        let port_id = self.topology.neighbour(neighbour)?.port;
        self.port(port_id).map(|port| (port_id, port))
    }

    /// Hello postponed because its link is not up
    pub(crate) fn on_hello_skipped(&mut self, neighbour: NodeAddress) {
        let now = self.now();
        let delay = self.config.hello_retry_delay_msec;
        if let Some(n) = self.topology.neighbour_mut(neighbour) {
            n.beacon_base = now;
            n.hello_delay_base = now;
            n.hello_delay_msec = delay;
        }
    }

    pub(crate) fn on_hello_response(&mut self, neighbour: NodeAddress, port: PortId, info: HelloInfo) {
        self.settle_neighbour(neighbour, port, info);
    }

    /// Record the outcome of a hello exchange in either direction
    pub(crate) fn settle_neighbour(&mut self, address: NodeAddress, port_id: PortId, info: HelloInfo) {
        let Some(port) = self.port(port_id) else {
            return;
        };
        if !port.can_accept_neighbour(address) || address == self.this_node() {
            return;
        }
        let now = self.now();
        let hop_metric = info.hop_metric.max(port.hop_metric());
        let verification = calculate_verification_interval(
            info.verify_interval,
            port.verify_interval(),
            port.should_cap_timeout(),
        );

        if self.topology.neighbour(address).is_none() {
            self.topology
                .insert_neighbour(Neighbour::discovered(address, port_id, hop_metric, now));
        }
        let Some(neighbour) = self.topology.neighbour_mut(address) else {
            return;
        };
        let previous = neighbour.is_settled().then(|| neighbour.entry());
        neighbour.is_router = info.is_router;
        neighbour.hop_metric = hop_metric;
        neighbour.port = port_id;
        neighbour.physical_address = address;
        neighbour.verification_interval_msec = verification;
        neighbour.beacon_base = now;
        neighbour.hello_tries = 0;
        neighbour.hello_delay_msec = 0;
        neighbour.needs_hello_info = false;
        let entry = neighbour.entry();

        if info.is_router && !self.config.is_leaf_node {
            self.topology.ensure_router(address, now);
            if previous.is_none() {
                if let Some(record) = self.topology.router_mut(address) {
                    record.send_all = true;
                    record.get_all = true;
                    record.postpone(now, 0);
                }
            }
        }
        let this_node = self.this_node();
        self.topology
            .update_links(this_node, address, hop_metric, LinkChange::Added);
        if previous != Some(entry) {
            info!(
                "Neighbour {} on {}: router {}, metric {}, verify {}ms",
                address, port_id, info.is_router, hop_metric, verification
            );
            self.topology.record_list_change(entry, false);
        }
    }

    /// A hello went unanswered or was refused
    pub(crate) fn on_hello_failed(&mut self, address: NodeAddress, code: FailureCode) {
        let now = self.now();
        let max_tries = self.config.max_hello_tries;
        let delay = self.config.hello_retry_delay_msec;
        let Some(neighbour) = self.topology.neighbour_mut(address) else {
            return;
        };
        neighbour.hello_tries += 1;
        let give_up = code == FailureCode::UnreachableDestination
            || neighbour.needs_hello_info
            || neighbour.hello_tries > max_tries;
        if give_up {
            debug!("Giving up on neighbour {} ({})", address, code);
            self.drop_neighbour(address);
        } else {
            neighbour.hello_delay_base = now;
            neighbour.hello_delay_msec = delay;
        }
    }

    /// Remove a neighbour and fail whatever can no longer reach it
    pub(crate) fn drop_neighbour(&mut self, address: NodeAddress) {
        let Some(hop_metric) = self.topology.neighbour(address).map(|n| n.hop_metric) else {
            return;
        };
        let this_node = self.this_node();
        let update = self
            .topology
            .update_links(this_node, address, hop_metric, LinkChange::Deleted);
        let Some(neighbour) = update.purged_neighbour else {
            return;
        };
        info!("Neighbour {} lost on {}", address, neighbour.port);
        if let Some(port) = self.port(neighbour.port) {
            port.on_neighbour_lost(address);
        }
        // routes beyond the neighbour may have gone with its link
        let destinations: BTreeSet<NodeAddress> =
            self.transactions.keys().map(|key| key.destination).collect();
        for destination in destinations {
            self.fail_unroutable_transactions(destination);
        }
    }

    pub(crate) fn neighbour_list_for(&self, router: NodeAddress) -> NeighbourList {
        self.topology.list_for(router)
    }

    pub(crate) fn on_neighbour_list_received(&mut self, router: NodeAddress, list: &NeighbourList) {
        let now = self.now();
        if !self.topology.apply_neighbour_list(router, list, now) {
            debug!("Neighbour list from {} out of sync", router);
        }
        if let Some(record) = self.topology.router_mut(router) {
            record.postpone(now, 0);
        }
    }

    pub(crate) fn on_neighbour_list_sent(&mut self, router: NodeAddress, version: u8) {
        let now = self.now();
        let current = self.topology.list_version();
        if let Some(record) = self.topology.router_mut(router) {
            record.last_sent_version = Some(version);
            record.send_all = false;
            record.send_change = version != current;
            record.postpone(now, 0);
        }
    }

    pub(crate) fn on_neighbour_sync_failed(&mut self, router: NodeAddress, code: FailureCode) {
        let now = self.now();
        let delay = self.config.neighbour_list_retry_delay_msec;
        debug!("Neighbour list sync with {} failed: {}", router, code);
        if let Some(record) = self.topology.router_mut(router) {
            record.postpone(now, delay);
        }
    }
}
