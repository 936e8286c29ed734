//! Link-state topology and route generation
//!
//! The link table is everything this node knows about the network. Routes
//! are derived from it: for every link endpoint a shortest response time
//! search runs from the endpoint back to this node, passing only through
//! routers. The first hop of the search result is always a neighbour of this
//! node. Endpoints the search cannot reach have their links pruned.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use super::records::{Link, LinkChange, Neighbour, Route, RouterRecord};
use crate::hop_metric::HopMetric;
use crate::message::{is_valid_node_address, NeighbourEntry, NeighbourList, NodeAddress};

/// Changes to our own neighbour list kept for incremental updates
const MAX_LIST_CHANGES: usize = 32;

#[derive(Debug, Clone, Copy)]
struct ListChange {
    version: u8,
    entry: NeighbourEntry,
    removed: bool,
}

/// Per-node state of one route search
#[derive(Debug, Clone, Copy)]
struct Scratch {
    resp_msec: u64,
    via: Option<NodeAddress>,
    visited: bool,
}

/// Result of a link table update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkUpdate {
    pub changed: bool,
    /// Neighbour record dropped with a deleted link to this node
    pub purged_neighbour: Option<Neighbour>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    this_node: NodeAddress,
    links: BTreeMap<(NodeAddress, NodeAddress), Link>,
    neighbours: BTreeMap<NodeAddress, Neighbour>,
    routers: BTreeMap<NodeAddress, RouterRecord>,
    routes: BTreeMap<NodeAddress, Route>,
    static_routes: BTreeMap<NodeAddress, Route>,
    list_version: u8,
    changes: VecDeque<ListChange>,
}

impl Topology {
    pub fn new(this_node: NodeAddress) -> Self {
        Self {
            this_node,
            links: BTreeMap::new(),
            neighbours: BTreeMap::new(),
            routers: BTreeMap::new(),
            routes: BTreeMap::new(),
            static_routes: BTreeMap::new(),
            list_version: 0,
            changes: VecDeque::new(),
        }
    }

    pub fn this_node(&self) -> NodeAddress {
        self.this_node
    }

    /// Forget everything learned and take a new address. Static routes stay.
    /// Returns the neighbours that were dropped.
    pub fn reset(&mut self, this_node: NodeAddress) -> Vec<Neighbour> {
        self.this_node = this_node;
        self.links.clear();
        self.routers.clear();
        self.routes.clear();
        self.changes.clear();
        self.list_version = self.list_version.wrapping_add(1);
        std::mem::take(&mut self.neighbours).into_values().collect()
    }

    // ------------------------------------------------------------------
    // Neighbours and routers
    // ------------------------------------------------------------------

    pub fn neighbours(&self) -> impl Iterator<Item = &Neighbour> {
        self.neighbours.values()
    }

    pub fn neighbour(&self, address: NodeAddress) -> Option<&Neighbour> {
        self.neighbours.get(&address)
    }

    pub fn neighbour_mut(&mut self, address: NodeAddress) -> Option<&mut Neighbour> {
        self.neighbours.get_mut(&address)
    }

    pub fn insert_neighbour(&mut self, neighbour: Neighbour) {
        self.neighbours.insert(neighbour.address, neighbour);
    }

    pub fn routers(&self) -> impl Iterator<Item = &RouterRecord> {
        self.routers.values()
    }

    pub fn router(&self, address: NodeAddress) -> Option<&RouterRecord> {
        self.routers.get(&address)
    }

    pub fn router_mut(&mut self, address: NodeAddress) -> Option<&mut RouterRecord> {
        self.routers.get_mut(&address)
    }

    /// Make sure a record exists for `address`. Returns true if it was created.
    pub fn ensure_router(&mut self, address: NodeAddress, now: u64) -> bool {
        if address == self.this_node || !is_valid_node_address(address) {
            return false;
        }
        if self.routers.contains_key(&address) {
            return false;
        }
        debug!("Router {} discovered", address);
        self.routers.insert(address, RouterRecord::new(address, now));
        true
    }

    // ------------------------------------------------------------------
    // Links and routes
    // ------------------------------------------------------------------

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn link(&self, a: NodeAddress, b: NodeAddress) -> Option<&Link> {
        self.links.get(&Link::key(a, b))
    }

    /// Add, update or delete an edge and regenerate routes if anything changed.
    ///
    /// Deleting a link to this node also purges the neighbour record for the
    /// other endpoint.
    pub fn update_links(
        &mut self,
        a: NodeAddress,
        b: NodeAddress,
        hop_metric: HopMetric,
        change: LinkChange,
    ) -> LinkUpdate {
        let mut update = LinkUpdate::default();
        if a == b {
            return update;
        }
        let key = Link::key(a, b);
        match change {
            LinkChange::Added => {
                let link = Link::new(a, b, hop_metric);
                update.changed = self.links.insert(key, link) != Some(link);
            }
            LinkChange::Deleted => {
                update.changed = self.links.remove(&key).is_some();
                if let Some(other) = Link::new(a, b, hop_metric).other(self.this_node) {
                    if let Some(neighbour) = self.neighbours.remove(&other) {
                        if neighbour.is_settled() {
                            self.record_list_change(neighbour.entry(), true);
                        }
                        update.purged_neighbour = Some(neighbour);
                    }
                }
            }
        }
        if update.changed {
            self.generate_routes_from_links();
        }
        update
    }

    /// Recompute every dynamic route from the link table
    pub fn generate_routes_from_links(&mut self) {
        self.routes.clear();
        let snapshot: Vec<Link> = self.links.values().copied().collect();
        let mut unreachable = BTreeSet::new();
        let mut dead_links = BTreeSet::new();

        for link in &snapshot {
            for endpoint in [link.id1, link.id2] {
                if endpoint == self.this_node || self.routes.contains_key(&endpoint) {
                    continue;
                }
                let found = if unreachable.contains(&endpoint) {
                    None
                } else {
                    self.shortest_path_to_self(endpoint)
                };
                match found {
                    Some(route) => {
                        self.routes.insert(endpoint, route);
                    }
                    None => {
                        unreachable.insert(endpoint);
                        dead_links.insert(Link::key(link.id1, link.id2));
                    }
                }
            }
        }

        for key in dead_links {
            debug!("Pruning unreachable link {}-{}", key.0, key.1);
            self.links.remove(&key);
        }
        let links = &self.links;
        self.routers
            .retain(|address, _| links.values().any(|link| link.touches(*address)));
    }

    /// Dijkstra from `start` toward this node over routers. The route uses
    /// the node the search reached this node from.
    fn shortest_path_to_self(&self, start: NodeAddress) -> Option<Route> {
        let mut scratch: BTreeMap<NodeAddress, Scratch> = BTreeMap::new();
        scratch.insert(
            start,
            Scratch {
                resp_msec: 0,
                via: None,
                visited: false,
            },
        );

        loop {
            let (current, resp_msec) = scratch
                .iter()
                .filter(|(_, s)| !s.visited)
                .min_by_key(|(address, s)| (s.resp_msec, **address))
                .map(|(address, s)| (*address, s.resp_msec))?;
            let via = {
                let entry = scratch.get_mut(&current)?;
                entry.visited = true;
                entry.via
            };

            if current == self.this_node {
                let neighbour = self.neighbours.get(&via?)?;
                return Some(Route {
                    destination: start,
                    neighbour_id: neighbour.address,
                    port: neighbour.port,
                    response_time_msec: resp_msec.min(u32::MAX as u64) as u32,
                });
            }

            for link in self.links.values().filter(|link| link.touches(current)) {
                let Some(next) = link.other(current) else {
                    continue;
                };
                if next != self.this_node && !self.routers.contains_key(&next) {
                    continue;
                }
                let cost = resp_msec + link.hop_metric.response_time_msec() as u64;
                let entry = scratch.entry(next).or_insert(Scratch {
                    resp_msec: u64::MAX,
                    via: None,
                    visited: false,
                });
                if !entry.visited && cost < entry.resp_msec {
                    entry.resp_msec = cost;
                    entry.via = Some(current);
                }
            }
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn dynamic_route(&self, destination: NodeAddress) -> Option<&Route> {
        self.routes.get(&destination)
    }

    pub fn static_routes(&self) -> impl Iterator<Item = &Route> {
        self.static_routes.values()
    }

    /// Dynamic route, else static route
    pub fn find_route(&self, destination: NodeAddress) -> Option<Route> {
        self.routes
            .get(&destination)
            .or_else(|| self.static_routes.get(&destination))
            .copied()
    }

    pub fn set_static_route(&mut self, route: Route) {
        self.static_routes.insert(route.destination, route);
    }

    pub fn remove_static_route(&mut self, destination: NodeAddress) -> Option<Route> {
        self.static_routes.remove(&destination)
    }

    // ------------------------------------------------------------------
    // Neighbour lists
    // ------------------------------------------------------------------

    pub fn list_version(&self) -> u8 {
        self.list_version
    }

    /// Our current neighbour list: every settled neighbour
    pub fn neighbour_list_entries(&self) -> Vec<NeighbourEntry> {
        self.neighbours
            .values()
            .filter(|n| n.is_settled())
            .map(Neighbour::entry)
            .collect()
    }

    /// Note a change to our own neighbour list and owe it to every router
    pub fn record_list_change(&mut self, entry: NeighbourEntry, removed: bool) {
        self.list_version = self.list_version.wrapping_add(1);
        self.changes.push_back(ListChange {
            version: self.list_version,
            entry,
            removed,
        });
        while self.changes.len() > MAX_LIST_CHANGES {
            self.changes.pop_front();
        }
        for record in self.routers.values_mut() {
            record.send_change = true;
        }
    }

    /// The list to send to `router`: incremental when the change log covers
    /// everything since the version it last acknowledged, complete otherwise.
    pub fn list_for(&self, router: NodeAddress) -> NeighbourList {
        let complete = NeighbourList::Complete {
            version: self.list_version,
            entries: self.neighbour_list_entries(),
        };
        let Some(record) = self.routers.get(&router) else {
            return complete;
        };
        let Some(base) = record.last_sent_version.filter(|_| !record.send_all) else {
            return complete;
        };
        let missing = self.list_version.wrapping_sub(base) as usize;
        if missing > self.changes.len() {
            return complete;
        }

        let mut added: BTreeMap<NodeAddress, NeighbourEntry> = BTreeMap::new();
        let mut removed: BTreeMap<NodeAddress, NeighbourEntry> = BTreeMap::new();
        for change in self.changes.iter().skip(self.changes.len() - missing) {
            let address = change.entry.address;
            if change.removed {
                if added.remove(&address).is_none() {
                    removed.insert(address, change.entry);
                }
            } else {
                removed.remove(&address);
                added.insert(address, change.entry);
            }
        }
        debug_assert!(self
            .changes
            .back()
            .map_or(missing == 0, |c| c.version == self.list_version));
        NeighbourList::Incremental {
            version: self.list_version,
            base_version: base,
            added: added.into_values().collect(),
            removed: removed.into_values().collect(),
        }
    }

    /// A link we negotiated ourselves; peers' lists never touch it
    fn is_direct_link(&self, reporter: NodeAddress, other: NodeAddress) -> bool {
        other == self.this_node && self.neighbours.contains_key(&reporter)
    }

    fn apply_entry(&mut self, reporter: NodeAddress, entry: &NeighbourEntry, now: u64) {
        if entry.address == reporter
            || !is_valid_node_address(entry.address)
            || self.is_direct_link(reporter, entry.address)
        {
            return;
        }
        self.links.insert(
            Link::key(reporter, entry.address),
            Link::new(reporter, entry.address, entry.hop_metric),
        );
        if entry.is_router {
            self.ensure_router(entry.address, now);
        }
    }

    /// Merge a neighbour list reported by `reporter`.
    ///
    /// Returns false if an incremental list does not start from the version
    /// we hold; the router is then flagged for a complete list.
    pub fn apply_neighbour_list(
        &mut self,
        reporter: NodeAddress,
        list: &NeighbourList,
        now: u64,
    ) -> bool {
        self.ensure_router(reporter, now);
        match list {
            NeighbourList::Complete { version, entries } => {
                let listed: BTreeSet<NodeAddress> = entries.iter().map(|e| e.address).collect();
                let stale: Vec<(NodeAddress, NodeAddress)> = self
                    .links
                    .values()
                    .filter_map(|link| link.other(reporter).map(|other| (link, other)))
                    .filter(|(_, other)| {
                        !listed.contains(other) && !self.is_direct_link(reporter, *other)
                    })
                    .map(|(link, _)| Link::key(link.id1, link.id2))
                    .collect();
                for key in stale {
                    self.links.remove(&key);
                }
                for entry in entries {
                    self.apply_entry(reporter, entry, now);
                }
                if let Some(record) = self.routers.get_mut(&reporter) {
                    record.neighbour_list_version = Some(*version);
                    record.get_all = false;
                    record.validated = true;
                }
            }
            NeighbourList::Incremental {
                version,
                base_version,
                added,
                removed,
            } => {
                let in_sync = self
                    .routers
                    .get(&reporter)
                    .map_or(false, |r| r.neighbour_list_version == Some(*base_version));
                if !in_sync {
                    if let Some(record) = self.routers.get_mut(&reporter) {
                        record.get_all = true;
                    }
                    return false;
                }
                for entry in removed {
                    if !self.is_direct_link(reporter, entry.address) {
                        self.links.remove(&Link::key(reporter, entry.address));
                    }
                }
                for entry in added {
                    self.apply_entry(reporter, entry, now);
                }
                if let Some(record) = self.routers.get_mut(&reporter) {
                    record.neighbour_list_version = Some(*version);
                }
            }
        }
        self.generate_routes_from_links();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PortId;

    const PORT: PortId = PortId(1);

    fn metric(code: u8) -> HopMetric {
        HopMetric::from_code(code)
    }

    fn settled(address: NodeAddress, is_router: bool) -> Neighbour {
        let mut n = Neighbour::discovered(address, PORT, metric(1), 0);
        n.is_router = is_router;
        n.hello_tries = 0;
        n.needs_hello_info = false;
        n
    }

    /// This node 1 with router neighbours 2 and 3
    fn star() -> Topology {
        let mut topo = Topology::new(1);
        for address in [2, 3] {
            topo.insert_neighbour(settled(address, true));
            topo.ensure_router(address, 0);
            topo.update_links(1, address, metric(1), LinkChange::Added);
        }
        topo
    }

    #[test]
    fn test_direct_neighbour_route() {
        let topo = star();
        let route = topo.find_route(2).unwrap();
        assert_eq!(route.neighbour_id, 2);
        assert_eq!(route.port, PORT);
        assert_eq!(route.response_time_msec, 1_000);
    }

    #[test]
    fn test_multi_hop_picks_cheapest_first_hop() {
        let mut topo = star();
        topo.ensure_router(4, 0);
        topo.update_links(2, 4, metric(4), LinkChange::Added);
        topo.update_links(3, 4, metric(2), LinkChange::Added);
        topo.update_links(4, 9, metric(0), LinkChange::Added);

        let route = topo.find_route(9).unwrap();
        assert_eq!(route.neighbour_id, 3);
        assert_eq!(route.response_time_msec, 200 + 5_000 + 1_000);
    }

    #[test]
    fn test_leaf_nodes_do_not_relay() {
        let mut topo = Topology::new(1);
        topo.insert_neighbour(settled(2, false));
        topo.update_links(1, 2, metric(1), LinkChange::Added);
        topo.update_links(2, 5, metric(1), LinkChange::Added);

        assert!(topo.find_route(2).is_some());
        assert!(topo.find_route(5).is_none());
        assert!(topo.link(2, 5).is_none());
    }

    #[test]
    fn test_route_generation_is_idempotent() {
        let mut topo = star();
        topo.ensure_router(4, 0);
        topo.update_links(2, 4, metric(3), LinkChange::Added);
        topo.update_links(3, 4, metric(3), LinkChange::Added);
        let before: Vec<Route> = topo.routes().copied().collect();
        topo.generate_routes_from_links();
        let after: Vec<Route> = topo.routes().copied().collect();
        assert_eq!(before, after);
        topo.generate_routes_from_links();
        assert_eq!(after, topo.routes().copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_isolated_component_is_pruned() {
        let mut topo = star();
        for address in [10, 11, 12] {
            topo.ensure_router(address, 0);
        }
        topo.links.insert(Link::key(10, 11), Link::new(10, 11, metric(1)));
        topo.links.insert(Link::key(11, 12), Link::new(11, 12, metric(1)));
        topo.generate_routes_from_links();

        assert!(topo.link(10, 11).is_none());
        assert!(topo.link(11, 12).is_none());
        for address in [10, 11, 12] {
            assert!(topo.find_route(address).is_none());
            assert!(topo.router(address).is_none());
        }
        assert!(topo.find_route(2).is_some());
        assert_eq!(topo.links().count(), 2);
    }

    #[test]
    fn test_deleting_direct_link_purges_neighbour() {
        let mut topo = star();
        let update = topo.update_links(3, 1, metric(1), LinkChange::Deleted);
        assert!(update.changed);
        assert_eq!(update.purged_neighbour.map(|n| n.address), Some(3));
        assert!(topo.neighbour(3).is_none());
        assert!(topo.find_route(3).is_none());
        assert!(topo.router(3).is_none());
    }

    #[test]
    fn test_static_route_is_fallback() {
        let mut topo = star();
        topo.set_static_route(Route {
            destination: 40,
            neighbour_id: 2,
            port: PORT,
            response_time_msec: 9_000,
        });
        assert_eq!(topo.find_route(40).unwrap().neighbour_id, 2);
        topo.generate_routes_from_links();
        assert!(topo.find_route(40).is_some());
        assert!(topo.remove_static_route(40).is_some());
        assert!(topo.find_route(40).is_none());
    }

    #[test]
    fn test_complete_list_replaces_reporter_links() {
        let mut topo = star();
        let entry = |address, is_router| NeighbourEntry {
            address,
            is_router,
            hop_metric: metric(2),
        };
        let list = NeighbourList::Complete {
            version: 1,
            entries: vec![entry(1, true), entry(20, false), entry(21, true)],
        };
        assert!(topo.apply_neighbour_list(2, &list, 0));
        assert_eq!(topo.find_route(20).unwrap().neighbour_id, 2);
        assert!(topo.router(21).is_some());
        // the direct link keeps the metric negotiated by hello
        assert_eq!(topo.link(1, 2).unwrap().hop_metric, metric(1));

        let list = NeighbourList::Complete {
            version: 2,
            entries: vec![entry(21, true)],
        };
        assert!(topo.apply_neighbour_list(2, &list, 0));
        assert!(topo.link(2, 20).is_none());
        assert!(topo.link(1, 2).is_some());
        assert_eq!(topo.router(2).unwrap().neighbour_list_version, Some(2));
    }

    #[test]
    fn test_incremental_list_requires_matching_base() {
        let mut topo = star();
        let added = vec![NeighbourEntry {
            address: 30,
            is_router: false,
            hop_metric: metric(1),
        }];
        let list = NeighbourList::Incremental {
            version: 5,
            base_version: 4,
            added: added.clone(),
            removed: vec![],
        };
        assert!(!topo.apply_neighbour_list(2, &list, 0));
        assert!(topo.router(2).unwrap().get_all);
        assert!(topo.find_route(30).is_none());

        topo.router_mut(2).unwrap().neighbour_list_version = Some(4);
        assert!(topo.apply_neighbour_list(2, &list, 0));
        assert!(topo.find_route(30).is_some());
        assert_eq!(topo.router(2).unwrap().neighbour_list_version, Some(5));
    }

    #[test]
    fn test_list_for_router_uses_change_log() {
        let mut topo = star();
        assert!(matches!(topo.list_for(2), NeighbourList::Complete { .. }));

        let version = topo.list_version();
        let record = topo.router_mut(2).unwrap();
        record.send_all = false;
        record.last_sent_version = Some(version);

        topo.record_list_change(settled(7, false).entry(), false);
        topo.record_list_change(settled(8, false).entry(), false);
        topo.record_list_change(settled(7, false).entry(), true);
        assert!(topo.router(2).unwrap().send_change);

        match topo.list_for(2) {
            NeighbourList::Incremental {
                version: v,
                base_version,
                added,
                removed,
            } => {
                assert_eq!(base_version, version);
                assert_eq!(v, version.wrapping_add(3));
                assert_eq!(added.iter().map(|e| e.address).collect::<Vec<_>>(), vec![8]);
                assert!(removed.is_empty());
            }
            other => panic!("expected incremental list, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_clears_learned_state() {
        let mut topo = star();
        topo.set_static_route(Route {
            destination: 40,
            neighbour_id: 2,
            port: PORT,
            response_time_msec: 0,
        });
        let dropped = topo.reset(9);
        assert_eq!(dropped.len(), 2);
        assert_eq!(topo.this_node(), 9);
        assert_eq!(topo.links().count(), 0);
        assert_eq!(topo.routers().count(), 0);
        assert!(topo.find_route(40).is_some());
    }
}
