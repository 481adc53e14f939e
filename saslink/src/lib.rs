mod config;
pub use config::*;

mod port;
pub use port::*;

pub mod framing;
pub use framing::{Classification, Framer, LinkState};

pub mod monitor;
pub use monitor::{ActivityMonitor, Clock, StdClock};

mod link;
pub use link::*;

pub mod bridge;
pub use bridge::BridgePort;

/// Re-export to allow using [BridgePort] with [std::io] streams.
pub use embedded_io_adapters::std::FromStd;

#[cfg(test)]
mod mock;
