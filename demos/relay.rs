//! `relay`: a small CLI front-end over the `relaycore` library.
//!
//! Loads an `EngineConfig` from a TOML file, runs the engine against an
//! already-open tunnel fd, and wires `SIGINT`/`SIGTERM` to
//! `StopHandle::signal_stop` so Ctrl-C shuts the relay down cleanly.

use clap::Parser;
use relaycore::{Engine, EngineConfig};
use std::os::unix::io::RawFd;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "User-space TUN-to-SOCKS4 packet relay")]
struct Args {
    /// File descriptor of an already-open tunnel device, inherited from
    /// the process that set up the virtual interface.
    #[arg(long)]
    tunnel_fd: RawFd,

    /// Path to a TOML configuration file.
    #[arg(long, default_value = "relaycore.toml")]
    config: std::path::PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = match EngineConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(%e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let engine = match Engine::new(config, args.tunnel_fd) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(%e, "engine initialization failed");
            return ExitCode::FAILURE;
        }
    };

    let stop = engine.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.signal_stop()) {
        tracing::warn!(%e, "failed to install Ctrl-C handler, signal_stop only reachable programmatically");
    }

    match engine.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(%e, "engine exited with error");
            ExitCode::FAILURE
        }
    }
}
