// Transport module — the port contract and an in-memory loopback link

pub mod abstraction;
pub mod loopback;

pub use abstraction::{Port, PortId};
pub use loopback::{LoopbackEvent, LoopbackLink, LoopbackPort, LoopbackSettings};
