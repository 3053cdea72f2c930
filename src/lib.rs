//! Core library of the Vantage VPN desktop daemon.
//!
//! This crate contains everything the privileged daemon needs to establish
//! and supervise a tunnel and to talk to the Vantage control plane:
//!
//! - `vpn`: normalized state model, the per-protocol tunnel adapters
//!   (OpenVPN child process, WireGuard OS service) and the session engine
//!   that supervises exactly one of them at a time.
//! - `api`: control-plane client with certificate-key pinning and
//!   alternate-IP failover.
//! - `platform`: thin contracts toward the privileged platform helpers
//!   (DNS override, subprocess execution, connectivity probing) that the
//!   daemon binaries implement per OS.
//!
//! The IPC surface toward UI clients, firewall enforcement and routing
//! manipulation live in the daemon binaries, not here.

pub mod api;
pub mod platform;
pub mod vpn;

pub use vpn::session::SessionEngine;
pub use vpn::state::{State, StateInfo, VpnType};
