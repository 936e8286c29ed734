//! Router — the PakBus routing and transaction core
//!
//! One `Router` owns everything a node knows: the topology, the registered
//! ports, the queue of messages waiting for a port, and every live
//! transaction. Nothing blocks. Ports push received messages in and pull
//! outgoing ones; the application calls `poll` to run timers.
//!
//! Transaction callbacks never run from inside another router call. Work is
//! posted to a FIFO event queue and drained at the end of every public entry
//! point, with the transaction taken out of its table slot while its handler
//! runs so it can freely call back into the router.

mod focus;
mod inbound;
mod maintenance;
mod neighbours;
mod outbound;

pub use maintenance::{RouterSnapshot, TranSummary};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

use crate::config::RouterConfig;
use crate::crypto::{ChaChaCipher, Cipher, CipherRegistry};
use crate::message::{
    is_valid_node_address, FailureCode, Message, NodeAddress, Priority, ProtocolError,
    BROADCAST_ADDRESS,
};
use crate::routing::{Route, Topology};
use crate::timer::{Clock, OneShot, TimerId};
use crate::tran::{
    CommandOutcome, EchoOutcome, GetSettingsOutcome, MessageSerial, SetSettingsOutcome,
    TerminateOutcome, TerminateTran, TranClient, TranCommand, TranCore, TranEcho,
    TranGetSettings, TranKey, TranKind, TranSetSettings, TranState, TranTimer, Transaction,
};
use crate::transport::{Port, PortId};
use crate::PakBusError;

/// Receives application traffic the router does not consume itself
pub trait ApplicationHandler: Send + Sync {
    /// Handle a BMP5 or datagram message addressed to this node. Returns
    /// false if the protocol is not served here.
    fn on_message(&self, message: &Message) -> bool;
}

/// Backs the string settings commands
pub trait SettingsHandler: Send + Sync {
    /// Values for `names`; every known setting when `names` is empty
    fn get_settings(&self, names: &[String]) -> Vec<(String, String)>;

    /// Apply settings in order. On failure returns the index of the first
    /// setting that was rejected.
    fn set_settings(&self, settings: &[(String, String)]) -> Result<(), usize>;
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub forwarded: u64,
    pub dropped_hop_limit: u64,
    pub delivery_faults_sent: u64,
    pub decrypt_failures: u64,
    pub transactions_opened: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerClient {
    Maintenance,
    Tran(TranKey, TranTimer),
}

pub(crate) enum RouterEvent {
    /// Process a message addressed to this node
    Deliver {
        port: Option<PortId>,
        message: Message,
    },
    FocusStart(TranKey),
    TranMessage(TranKey, Message),
    TranFailure(TranKey, FailureCode),
    TranTimer(TranKey, TranTimer, TimerId),
    TranSending(TranKey, MessageSerial),
    Close(TranKey),
}

/// A transaction is `Busy` while one of its handlers runs
pub(crate) enum TranSlot {
    Ready(Box<Transaction>),
    Busy,
}

pub(crate) struct PortEntry {
    pub port: Weak<dyn Port>,
    pub last_beacon: Option<u64>,
}

/// A message waiting for its port to pull it
#[derive(Debug, Clone)]
pub(crate) struct QueuedMessage {
    pub serial: MessageSerial,
    pub message: Message,
    pub port: PortId,
    pub physical_destination: NodeAddress,
    pub owner: Option<TranKey>,
    pub queued_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FocusRequest {
    pub key: TranKey,
    pub priority: Priority,
    pub seq: u64,
}

pub struct Router {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    topology: Topology,
    ports: BTreeMap<PortId, PortEntry>,
    next_port_id: u32,
    ciphers: CipherRegistry,
    app_handler: Option<Weak<dyn ApplicationHandler>>,
    settings_handler: Option<Weak<dyn SettingsHandler>>,

    transactions: BTreeMap<TranKey, TranSlot>,
    last_tran_id: u8,
    waiting: Vec<FocusRequest>,
    next_focus_seq: u64,
    focus: Option<TranKey>,
    router_tran: Option<TranKey>,

    unrouted: Vec<QueuedMessage>,
    next_serial: MessageSerial,

    timers: OneShot<TimerClient>,
    maintenance_timer: TimerId,
    last_snapshot: u64,

    events: VecDeque<RouterEvent>,
    pumping: bool,
    stats: RouterStats,
}

impl Router {
    pub fn new(config: RouterConfig, clock: Arc<dyn Clock>) -> Result<Self, PakBusError> {
        config.validate()?;
        let mut ciphers = CipherRegistry::new();
        for (address, passphrase) in &config.ciphers {
            ciphers.set(*address, Arc::new(ChaChaCipher::from_passphrase(passphrase)));
        }

        let now = clock.now_msec();
        let mut timers = OneShot::new();
        let maintenance_timer =
            timers.arm(TimerClient::Maintenance, now, config.maintenance_interval_msec);
        info!(
            "PakBus router {} started{}",
            config.this_node_address,
            if config.is_leaf_node { " as leaf node" } else { "" }
        );

        Ok(Self {
            topology: Topology::new(config.this_node_address),
            config,
            clock,
            ports: BTreeMap::new(),
            next_port_id: 1,
            ciphers,
            app_handler: None,
            settings_handler: None,
            transactions: BTreeMap::new(),
            last_tran_id: 0,
            waiting: Vec::new(),
            next_focus_seq: 0,
            focus: None,
            router_tran: None,
            unrouted: Vec::new(),
            next_serial: 1,
            timers,
            maintenance_timer,
            last_snapshot: now,
            events: VecDeque::new(),
            pumping: false,
            stats: RouterStats::default(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn this_node(&self) -> NodeAddress {
        self.topology.this_node()
    }

    pub fn is_leaf_node(&self) -> bool {
        self.config.is_leaf_node
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Monotonic milliseconds from the router's clock
    pub fn now(&self) -> u64 {
        self.clock.now_msec()
    }

    pub fn wall_time(&self) -> (u32, u32) {
        self.clock.wall_time()
    }

    pub fn max_tran_retries(&self) -> u32 {
        self.config.max_tran_retries
    }

    /// The client transaction that currently holds focus
    pub fn focus_holder(&self) -> Option<TranKey> {
        self.focus
    }

    /// The router-sponsored transaction in progress
    pub fn router_transaction(&self) -> Option<TranKey> {
        self.router_tran
    }

    /// Transactions waiting for focus, in the order they would be considered
    pub fn waiting_transactions(&self) -> Vec<TranKey> {
        self.waiting.iter().map(|request| request.key).collect()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_transaction_live(&self, key: TranKey) -> bool {
        self.transactions.contains_key(&key)
    }

    pub fn transaction_state(&self, key: TranKey) -> Option<TranState> {
        match self.transactions.get(&key)? {
            TranSlot::Ready(tran) => Some(tran.core.state),
            TranSlot::Busy => None,
        }
    }

    /// Messages queued for ports and not yet pulled
    pub fn queued_message_count(&self) -> usize {
        self.unrouted.len()
    }

    /// Route the router would use to reach `destination`
    pub fn route_to(&self, destination: NodeAddress) -> Result<Route, PakBusError> {
        self.resolve_route(destination)
            .ok_or(PakBusError::NoRoute(destination))
    }

    // ------------------------------------------------------------------
    // Ports, routes, ciphers and handlers
    // ------------------------------------------------------------------

    /// Register a port. The router keeps only a weak reference.
    pub fn register_port<P: Port + 'static>(&mut self, port: &Arc<P>) -> PortId {
        let id = PortId(self.next_port_id);
        self.next_port_id += 1;
        let weak = Arc::downgrade(port);
        let weak: Weak<dyn Port> = weak;
        info!("Registered {} ({})", id, port.port_name());
        self.ports.insert(
            id,
            PortEntry {
                port: weak,
                last_beacon: None,
            },
        );
        id
    }

    /// Forget a port together with its neighbours, static routes and queued messages
    pub fn unregister_port(&mut self, id: PortId) -> Result<(), PakBusError> {
        if self.ports.remove(&id).is_none() {
            return Err(PakBusError::PortNotRegistered(id));
        }
        info!("Unregistered {}", id);

        let lost: Vec<NodeAddress> = self
            .topology
            .neighbours()
            .filter(|n| n.port == id)
            .map(|n| n.address)
            .collect();
        for address in lost {
            self.drop_neighbour(address);
        }

        let stale: Vec<NodeAddress> = self
            .topology
            .static_routes()
            .filter(|r| r.port == id)
            .map(|r| r.destination)
            .collect();
        for destination in stale {
            self.topology.remove_static_route(destination);
        }

        self.withdraw_port_messages(id, FailureCode::UnreachableDestination);
        self.pump_events();
        Ok(())
    }

    pub fn set_static_route(
        &mut self,
        destination: NodeAddress,
        port: PortId,
        neighbour: NodeAddress,
        response_time_msec: u32,
    ) -> Result<(), PakBusError> {
        if !is_valid_node_address(destination) {
            return Err(PakBusError::InvalidAddress(destination));
        }
        if !is_valid_node_address(neighbour) {
            return Err(PakBusError::InvalidAddress(neighbour));
        }
        if !self.ports.contains_key(&port) {
            return Err(PakBusError::PortNotRegistered(port));
        }
        self.topology.set_static_route(Route {
            destination,
            neighbour_id: neighbour,
            port,
            response_time_msec,
        });
        Ok(())
    }

    pub fn remove_static_route(&mut self, destination: NodeAddress) -> Option<Route> {
        self.topology.remove_static_route(destination)
    }

    /// Install a cipher for a peer; 4095 sets the default
    pub fn set_cipher(&mut self, address: NodeAddress, cipher: Arc<dyn Cipher>) {
        self.ciphers.set(address, cipher);
    }

    pub fn remove_cipher(&mut self, address: NodeAddress) -> bool {
        self.ciphers.remove(address)
    }

    pub fn set_application_handler<H: ApplicationHandler + 'static>(&mut self, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn ApplicationHandler> = weak;
        self.app_handler = Some(weak);
    }

    pub fn set_settings_handler<H: SettingsHandler + 'static>(&mut self, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn SettingsHandler> = weak;
        self.settings_handler = Some(weak);
    }

    /// Take a new address. Everything learned about the network is forgotten.
    pub fn set_this_node_address(&mut self, address: NodeAddress) -> Result<(), PakBusError> {
        if !is_valid_node_address(address) {
            return Err(PakBusError::InvalidAddress(address));
        }
        self.config.this_node_address = address;
        self.reset_topology();
        Ok(())
    }

    /// Switch leaf mode. Neighbours are relearned from scratch.
    pub fn set_is_leaf_node(&mut self, is_leaf_node: bool) {
        if self.config.is_leaf_node != is_leaf_node {
            self.config.is_leaf_node = is_leaf_node;
            self.reset_topology();
        }
    }

    fn reset_topology(&mut self) {
        let dropped = self.topology.reset(self.config.this_node_address);
        info!(
            "Router {} reset, {} neighbours dropped",
            self.config.this_node_address,
            dropped.len()
        );
        for neighbour in &dropped {
            if let Some(port) = self.port(neighbour.port) {
                port.on_neighbour_lost(neighbour.address);
            }
            self.fail_unroutable_transactions(neighbour.address);
        }
        self.pump_events();
    }

    pub(crate) fn port(&self, id: PortId) -> Option<Arc<dyn Port>> {
        self.ports.get(&id).and_then(|entry| entry.port.upgrade())
    }

    // ------------------------------------------------------------------
    // Opening transactions
    // ------------------------------------------------------------------

    /// Time a round trip to `destination` with a `packet_size` byte echo
    pub fn open_echo<C>(
        &mut self,
        destination: NodeAddress,
        packet_size: usize,
        priority: Priority,
        client: &Arc<C>,
    ) -> Result<TranKey, PakBusError>
    where
        C: TranClient<EchoOutcome> + 'static,
    {
        let client = Arc::downgrade(client);
        let client: Weak<dyn TranClient<EchoOutcome>> = client;
        let kind = TranKind::Echo(TranEcho::new(packet_size, client));
        self.open_client_transaction(destination, priority, kind)
    }

    /// Ask `relay` to echo `target` and report the outcome back here
    pub fn open_relayed_echo<C>(
        &mut self,
        relay: NodeAddress,
        target: NodeAddress,
        packet_size: usize,
        priority: Priority,
        client: &Arc<C>,
    ) -> Result<TranKey, PakBusError>
    where
        C: TranClient<EchoOutcome> + 'static,
    {
        if !is_valid_node_address(target) {
            return Err(PakBusError::InvalidAddress(target));
        }
        let client = Arc::downgrade(client);
        let client: Weak<dyn TranClient<EchoOutcome>> = client;
        let kind = TranKind::Echo(TranEcho::through_relay(target, packet_size, client));
        self.open_client_transaction(relay, priority, kind)
    }

    pub fn open_get_settings<C>(
        &mut self,
        destination: NodeAddress,
        names: Vec<String>,
        priority: Priority,
        client: &Arc<C>,
    ) -> Result<TranKey, PakBusError>
    where
        C: TranClient<GetSettingsOutcome> + 'static,
    {
        let client = Arc::downgrade(client);
        let client: Weak<dyn TranClient<GetSettingsOutcome>> = client;
        let kind = TranKind::GetSettings(TranGetSettings::new(names, client));
        self.open_client_transaction(destination, priority, kind)
    }

    pub fn open_set_settings<C>(
        &mut self,
        destination: NodeAddress,
        settings: Vec<(String, String)>,
        priority: Priority,
        client: &Arc<C>,
    ) -> Result<TranKey, PakBusError>
    where
        C: TranClient<SetSettingsOutcome> + 'static,
    {
        let client = Arc::downgrade(client);
        let client: Weak<dyn TranClient<SetSettingsOutcome>> = client;
        let kind = TranKind::SetSettings(TranSetSettings::new(settings, client));
        self.open_client_transaction(destination, priority, kind)
    }

    /// Send an application built request and wait for its answer. The
    /// transaction number in `request` is replaced.
    pub fn open_command<C>(
        &mut self,
        request: Message,
        priority: Priority,
        base_timeout_msec: Option<u32>,
        client: &Arc<C>,
    ) -> Result<TranKey, PakBusError>
    where
        C: TranClient<CommandOutcome> + 'static,
    {
        if !request.has_transaction_header() {
            return Err(ProtocolError::Malformed("command without transaction header".into()).into());
        }
        if request.is_response() {
            return Err(ProtocolError::Malformed("command carries a response type".into()).into());
        }
        let destination = request.destination;
        let client = Arc::downgrade(client);
        let client: Weak<dyn TranClient<CommandOutcome>> = client;
        let mut command = TranCommand::new(request, client);
        if let Some(msec) = base_timeout_msec {
            command = command.with_base_timeout(msec);
        }
        self.open_client_transaction(destination, priority, TranKind::Command(command))
    }

    /// Close the conversation with `destination` with a will-close bye
    pub fn open_terminate(
        &mut self,
        destination: NodeAddress,
        priority: Priority,
        client: Option<Weak<dyn TranClient<TerminateOutcome>>>,
    ) -> Result<TranKey, PakBusError> {
        let key = self.open_transaction(
            destination,
            priority,
            TranKind::Terminate(TerminateTran::new(client)),
            false,
        )?;
        let now = self.now();
        if let Some(TranSlot::Ready(tran)) = self.transactions.get_mut(&key) {
            tran.core.closing_timer = self.timers.arm(
                TimerClient::Tran(key, TranTimer::Closing),
                now,
                self.config.terminate_give_up_msec,
            );
        }
        self.pump_events();
        Ok(key)
    }

    /// Abort a transaction. Its client is told `Aborted`.
    /// Tag a live transaction with a caller chosen id that snapshots report.
    /// Returns false if the transaction is gone or its handler is running.
    pub fn set_report_id(&mut self, key: TranKey, report_id: u64) -> bool {
        match self.transactions.get_mut(&key) {
            Some(TranSlot::Ready(tran)) => {
                tran.core.report_id = report_id;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_transaction(&mut self, key: TranKey) {
        if self.transactions.contains_key(&key) {
            debug!("Cancelling transaction {}", key);
            self.events.push_back(RouterEvent::Close(key));
            self.pump_events();
        }
    }

    fn open_client_transaction(
        &mut self,
        destination: NodeAddress,
        priority: Priority,
        kind: TranKind,
    ) -> Result<TranKey, PakBusError> {
        let key = self.open_transaction(destination, priority, kind, false)?;
        self.pump_events();
        Ok(key)
    }

    pub(crate) fn open_transaction(
        &mut self,
        destination: NodeAddress,
        priority: Priority,
        kind: TranKind,
        router_sponsored: bool,
    ) -> Result<TranKey, PakBusError> {
        if !is_valid_node_address(destination) {
            return Err(PakBusError::InvalidAddress(destination));
        }
        let id = self.allocate_tran_id(destination);
        let key = TranKey { destination, id };
        let mut core = TranCore::new(key, priority, router_sponsored);
        debug!("Opening {} transaction {}", kind.name(), key);
        self.stats.transactions_opened += 1;

        if router_sponsored {
            core.state = TranState::Active;
            self.router_tran = Some(key);
            self.events.push_back(RouterEvent::FocusStart(key));
        } else {
            core.state = TranState::AwaitingFocus;
            self.request_focus(key, priority);
        }
        self.transactions
            .insert(key, TranSlot::Ready(Box::new(Transaction::new(core, kind))));
        Ok(key)
    }

    /// Next free id for `destination`, searching on from the last id handed out.
    ///
    /// # Panics
    /// When all 255 ids for `destination` are live.
    fn allocate_tran_id(&mut self, destination: NodeAddress) -> u8 {
        let mut id = self.last_tran_id;
        for _ in 0..u8::MAX {
            id = if id == u8::MAX { 1 } else { id + 1 };
            if !self.transactions.contains_key(&TranKey { destination, id }) {
                self.last_tran_id = id;
                return id;
            }
        }
        error!(
            "Transaction ids exhausted for node {}: {} live transactions, focus {:?}, {} waiting",
            destination,
            self.transactions.len(),
            self.focus,
            self.waiting.len()
        );
        panic!("transaction ids exhausted for node {}", destination);
    }

    // ------------------------------------------------------------------
    // Hooks used by transactions
    // ------------------------------------------------------------------

    /// Queue a message on behalf of a transaction
    pub(crate) fn send_tran_message(&mut self, core: &mut TranCore, mut message: Message) {
        message.source = self.this_node();
        message.destination = core.key.destination;
        message.priority = core.priority;
        message.set_transaction_no(core.key.id);
        let serial = self.route_message(message, Some(core.key));
        core.pending_messages.push(serial);
    }

    /// Ask for the transaction to be closed once its handler returns
    pub(crate) fn close_transaction(&mut self, core: &mut TranCore) {
        if core.state != TranState::Closing {
            core.state = TranState::Closing;
            self.timers.disarm(&mut core.watchdog);
            self.events.push_back(RouterEvent::Close(core.key));
        }
    }

    // ------------------------------------------------------------------
    // Event queue
    // ------------------------------------------------------------------

    /// Drain the event queue, granting focus whenever it runs dry
    pub(crate) fn pump_events(&mut self) {
        if self.pumping {
            return;
        }
        self.pumping = true;
        loop {
            while let Some(event) = self.events.pop_front() {
                self.handle_event(event);
            }
            self.set_next_transaction_focus();
            if self.events.is_empty() {
                break;
            }
        }
        self.pumping = false;
    }

    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Deliver { port, message } => self.dispatch_local(port, message, false),
            RouterEvent::FocusStart(key) => self.with_transaction(key, |tran, router| {
                tran.core.state = TranState::Active;
                tran.on_focus_start(router);
            }),
            RouterEvent::TranMessage(key, message) => {
                self.with_transaction(key, |tran, router| tran.on_message(router, message))
            }
            RouterEvent::TranFailure(key, code) => self.with_transaction(key, |tran, router| {
                router.timers.disarm(&mut tran.core.watchdog);
                tran.core.first_message_sent = false;
                tran.on_failure(router, code);
            }),
            RouterEvent::TranTimer(key, timer, id) => self.on_tran_timer(key, timer, id),
            RouterEvent::TranSending(key, serial) => self.on_tran_sending(key, serial),
            RouterEvent::Close(key) => self.close_now(key),
        }
    }

    /// Run `f` with the transaction taken out of its slot
    fn with_transaction<F>(&mut self, key: TranKey, f: F)
    where
        F: FnOnce(&mut Transaction, &mut Router),
    {
        let Some(slot) = self.transactions.get_mut(&key) else {
            return;
        };
        let TranSlot::Ready(mut tran) = std::mem::replace(slot, TranSlot::Busy) else {
            return;
        };
        if tran.core.is_closing() {
            *slot = TranSlot::Ready(tran);
            return;
        }
        f(tran.as_mut(), self);
        if let Some(slot) = self.transactions.get_mut(&key) {
            *slot = TranSlot::Ready(tran);
        }
    }

    fn on_tran_timer(&mut self, key: TranKey, timer: TranTimer, id: TimerId) {
        self.with_transaction(key, |tran, router| {
            let slot = match timer {
                TranTimer::Watchdog => &mut tran.core.watchdog,
                TranTimer::Closing => &mut tran.core.closing_timer,
                TranTimer::Unroutable => &mut tran.core.unroutable_timer,
            };
            if *slot != id {
                return;
            }
            *slot = 0;
            let code = match timer {
                TranTimer::Watchdog => {
                    debug!("Transaction {} timed out", key);
                    tran.core.first_message_sent = false;
                    FailureCode::TimedOutOrResourceError
                }
                TranTimer::Closing => FailureCode::TimedOutOrResourceError,
                TranTimer::Unroutable => {
                    debug!("Transaction {} lost its route", key);
                    FailureCode::UnreachableDestination
                }
            };
            tran.on_failure(router, code);
        });
    }

    /// A port pulled one of the transaction's messages
    fn on_tran_sending(&mut self, key: TranKey, serial: MessageSerial) {
        self.with_transaction(key, |tran, router| {
            let now = router.now();
            tran.core.pending_messages.retain(|s| *s != serial);
            tran.core.round_trip_base = now;
            let timeout = router.tran_time_out(&tran.core, &tran.kind);
            if !tran.core.first_message_sent {
                tran.core.first_message_sent = true;
                router.timers.disarm(&mut tran.core.watchdog);
                tran.core.watchdog =
                    router
                        .timers
                        .arm(TimerClient::Tran(key, TranTimer::Watchdog), now, timeout);
            } else if !router.timers.reset(tran.core.watchdog, now) {
                tran.core.watchdog =
                    router
                        .timers
                        .arm(TimerClient::Tran(key, TranTimer::Watchdog), now, timeout);
            }
            tran.on_sending_message(router);
        });
    }

    fn close_now(&mut self, key: TranKey) {
        let Some(slot) = self.transactions.remove(&key) else {
            return;
        };
        let mut tran = match slot {
            TranSlot::Ready(tran) => tran,
            TranSlot::Busy => {
                self.transactions.insert(key, TranSlot::Busy);
                return;
            }
        };
        tran.core.state = TranState::Closed;
        self.timers.disarm(&mut tran.core.watchdog);
        self.timers.disarm(&mut tran.core.closing_timer);
        self.timers.disarm(&mut tran.core.unroutable_timer);

        for serial in std::mem::take(&mut tran.core.pending_messages) {
            if let Some(pos) = self.unrouted.iter().position(|q| q.serial == serial) {
                let queued = self.unrouted.remove(pos);
                if let Some(port) = self.port(queued.port) {
                    port.on_message_aborted(queued.physical_destination);
                }
            }
        }

        self.waiting.retain(|request| request.key != key);
        if self.focus == Some(key) {
            self.focus = None;
        }
        debug!("Transaction {} ({}) closed", key, tran.kind.name());
        tran.on_close();

        if self.router_tran == Some(key) {
            self.router_tran = None;
            self.do_next_router_transaction();
        }
    }

    /// Fail every transaction to `destination` that no longer has a route
    pub(crate) fn fail_unroutable_transactions(&mut self, destination: NodeAddress) {
        if destination == self.this_node() || self.resolve_route(destination).is_some() {
            return;
        }
        let keys: Vec<TranKey> = self
            .transactions
            .keys()
            .filter(|key| key.destination == destination)
            .copied()
            .collect();
        for key in keys {
            self.events
                .push_back(RouterEvent::TranFailure(key, FailureCode::UnreachableDestination));
        }
    }

    pub(crate) fn is_broadcast_or_valid(address: NodeAddress) -> bool {
        address == BROADCAST_ADDRESS || is_valid_node_address(address)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        // every client hears about its transaction before the router goes away
        let keys: Vec<TranKey> = self.transactions.keys().copied().collect();
        for key in keys {
            if let Some(TranSlot::Ready(mut tran)) = self.transactions.remove(&key) {
                tran.core.state = TranState::Closed;
                tran.on_close();
            }
        }
    }
}
