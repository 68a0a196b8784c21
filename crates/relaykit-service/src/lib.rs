//! Servers built on relaykit
//!
//! - a SOCKS5 server serving CONNECT and UDP ASSOCIATE
//! - a UDP tunnel server, carrying SOCKS5 UDP envelopes on TCP connections
//! - an RPC server sharing one handler table between all of its connections
//!
//! Every client connection is a session: registered while it lives and closed once it has been idle for
//! [`Config::idle_timeout`].

#![crate_type = "lib"]

use std::io;

use tokio::runtime::{Builder, Runtime};

pub use self::{
    config::Config,
    server::{run, run_with_handlers},
};

pub mod config;
pub mod logging;
pub mod server;
mod utils;

/// Builds the runtime for `config`
///
/// A `worker_count` of 1 runs everything on the current thread.
pub fn build_runtime(config: &Config) -> io::Result<Runtime> {
    let mut builder = if config.worker_count <= 1 {
        Builder::new_current_thread()
    } else {
        let mut builder = Builder::new_multi_thread();
        builder.worker_threads(config.worker_count);
        builder
    };

    builder.enable_all().build()
}
