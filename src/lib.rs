//! relaycore: a single-threaded, user-space TUN-to-SOCKS4 packet relay.
//!
//! Raw IP packets read from a tunnel file descriptor are terminated in an
//! embedded TCP/IP stack ([`smoltcp`]), and each accepted connection is
//! bridged through an upstream SOCKS4 proxy. A UDP datagram destined to
//! port 53 is instead forwarded to a configured DNS resolver and its
//! reply relayed back to the guest. Everything else is dropped.
//!
//! ```no_run
//! use relaycore::{Engine, EngineConfig};
//!
//! # fn example(tunnel_fd: std::os::unix::io::RawFd, config: EngineConfig) -> relaycore::Result<()> {
//! let engine = Engine::new(config, tunnel_fd)?;
//! let stop = engine.stop_handle();
//! // stop.signal_stop() from another thread to shut down.
//! engine.run()
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

mod buffer;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod flow;
mod netstack;
mod reactor;
mod socks;
mod tunnel;

pub use config::EngineConfig;
pub use engine::{Engine, StopHandle};
pub use error::{Error, Result};
pub use flow::FlowId;
