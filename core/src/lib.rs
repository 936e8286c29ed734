// PakBus router core
//
// Link-state routing over an intermittently connected mesh, a transaction
// scheduler with a single focus slot per node, a one-shot timer service and
// transparent payload encryption. Physical I/O lives behind the `Port` trait.

pub mod config;
pub mod crypto;
pub mod hop_metric;
pub mod message;
pub mod router;
pub mod routing;
pub mod serial;
pub mod timer;
pub mod tran;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, RouterConfig};
pub use crypto::{ChaChaCipher, Cipher, CryptoError, EnvelopeByteOrder};
pub use hop_metric::HopMetric;
pub use message::{
    ExpectMore, FailureCode, Message, NodeAddress, Priority, ProtocolError, ProtocolType,
    BROADCAST_ADDRESS,
};
pub use router::{ApplicationHandler, Router, RouterSnapshot, RouterStats, SettingsHandler, TranSummary};
pub use timer::{Clock, ManualClock, SystemClock};
pub use tran::{
    CommandOutcome, EchoOutcome, EchoReport, GetSettingsOutcome, SetSettingsOutcome,
    TerminateOutcome, TranClient, TranFailure, TranKey, TranState,
};
pub use transport::{LoopbackEvent, LoopbackLink, LoopbackPort, LoopbackSettings, Port, PortId};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PakBusError {
    #[error("Invalid node address: {0}")]
    InvalidAddress(u16),

    #[error("{0} is not registered")]
    PortNotRegistered(PortId),

    #[error("No route to node {0}")]
    NoRoute(NodeAddress),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_router_rejects_invalid_config() {
        let clock = Arc::new(ManualClock::new(0));
        let result = Router::new(RouterConfig::for_node(0), clock);
        assert!(matches!(
            result.err(),
            Some(PakBusError::Config(ConfigError::InvalidNodeAddress(0)))
        ));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            PakBusError::PortNotRegistered(PortId(4)).to_string(),
            "port#4 is not registered"
        );
        assert_eq!(PakBusError::NoRoute(12).to_string(), "No route to node 12");
    }
}
