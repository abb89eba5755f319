//! Route-netlink object cache (§4.3): links, addresses, and routes
//! kept current via kernel multicast, with synchronous create/destroy
//! mutation primitives for the address acquisition engine to drive.

pub mod address;
pub mod cache;
pub mod error;
pub mod link;
pub mod route;

pub use address::{Address, AddressKey};
pub use cache::{AddressEvent, Groups, LinkEvent, RouteEvent, RtnlCache};
pub use error::CacheError;
pub use link::{Link, ObservedState};
pub use route::{Route, RouteKey};
