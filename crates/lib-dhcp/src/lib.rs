pub mod types;

mod constants;
mod error;
mod utils;

pub use constants::*;
pub use error::*;
pub use utils::*;
