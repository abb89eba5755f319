mod client;
mod engine;
mod error;
mod link_state;
mod registry;

pub use client::{AddressClient, ClientEvent, Dhcp4Client, Dhcp6Client, Ipv4LinkLocal, RouterDiscoveryClient};
pub use engine::{AddressInstaller, IpAcquisitionEngine};
pub use error::EngineError;
pub use link_state::LinkStateTracker;
pub use registry::EngineRegistry;
