pub mod error;
pub mod http;
pub mod link;
pub mod tcp;
pub mod util;

#[cfg(test)]
mod testlink;

pub use error::{Error, Result};
pub use link::{Egress, FlowTuple, Link};
