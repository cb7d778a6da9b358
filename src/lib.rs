pub mod mumble;
#[cfg(test)]
mod testing;
pub mod transport;

pub use mumble::{ControlHandle, Event, EventHandler, MumbleClient, MumbleConfig};
pub use transport::{ConnState, ConnectError, TransportError};

/// Default verbosity for the binary's logger when `RUST_LOG` is unset.
#[cfg(debug_assertions)]
pub fn log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

#[cfg(not(debug_assertions))]
pub fn log_level() -> log::LevelFilter {
    log::LevelFilter::Warn
}
