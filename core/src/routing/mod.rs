// Routing module — topology records and route generation

pub mod records;
pub mod topology;

pub use records::{
    broadcast_is_beacon, calculate_verification_interval, Link, LinkChange, Neighbour, Route,
    RouterRecord,
};
pub use topology::{LinkUpdate, Topology};
