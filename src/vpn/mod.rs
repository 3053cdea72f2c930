//! VPN session engine and tunnel adapters.
//!
//! Architecture:
//! - state.rs: normalized type/state model shared by all adapters
//! - openvpn/: OpenVPN adapter supervising an external child process
//! - wireguard/: WireGuard adapter supervising an OS-managed service
//! - session.rs: session engine owning at most one adapter at a time

pub mod openvpn;
pub mod session;
pub mod state;
pub mod wireguard;

pub use session::SessionEngine;
pub use state::{State, StateInfo, VpnType};

use crossbeam_channel::Sender;
use std::net::IpAddr;

/// Tunnel-side errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("tunnel service failure: {0}")]
    ServiceLifecycle(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Capability set every tunnel adapter implements.
///
/// An adapter instance is single-use: it is consumed by exactly one
/// [`Tunnel::connect`] call, and once [`Tunnel::disconnect`] has been
/// requested any further `connect` on the same instance fails immediately.
/// All control methods are safe to call from other threads while `connect`
/// is running.
pub trait Tunnel: Send + Sync {
    fn vpn_type(&self) -> VpnType;

    /// Idempotent pre-connect cleanup, e.g. removing a stale tunnel service
    /// left over from a crashed previous run. Called once before `connect`.
    fn init(&self) -> Result<()>;

    /// Drives the tunnel to `Connected` and then blocks until it exits or
    /// [`Tunnel::disconnect`] is invoked concurrently. Intermediate states
    /// are emitted into `state_sink`; a terminal `Disconnected` is emitted
    /// on every return path. Returns `Ok(())` on a clean exit.
    fn connect(&self, state_sink: &Sender<StateInfo>) -> Result<()>;

    /// Signals the in-flight `connect` to terminate. Idempotent.
    fn disconnect(&self) -> Result<()>;

    /// Tears the tunnel down while keeping the parameters needed to rebuild
    /// it. No-op unless the tunnel is connected.
    fn pause(&self) -> Result<()>;

    /// Rebuilds a paused tunnel. No-op unless paused.
    fn resume(&self) -> Result<()>;

    fn is_paused(&self) -> bool;

    /// Installs an override DNS address. If the tunnel is up, it is torn
    /// down and rebuilt with the new value; otherwise the value applies to
    /// the next connect. Setting the current value again is a no-op.
    fn set_manual_dns(&self, dns: IpAddr) -> Result<()>;

    /// Clears the override DNS address, restarting the tunnel if it is up.
    fn reset_manual_dns(&self) -> Result<()>;

    /// Peer address the firewall must keep reachable outside the tunnel.
    fn destination_ip(&self) -> Option<IpAddr>;

    /// Called when the system reports a routing-table change. Default no-op;
    /// adapters override it where the platform requires a reaction.
    fn on_routing_changed(&self) -> Result<()> {
        Ok(())
    }
}
