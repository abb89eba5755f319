mod addr;
mod addrs;
mod header;
mod htype;
mod lease;
mod message;
mod opcode;

pub use addr::*;
pub use addrs::*;
pub use header::*;
pub use htype::*;
pub use lease::*;
pub use message::*;
pub use opcode::*;
