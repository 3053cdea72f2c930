//! Normalized VPN type and connection-state model.
//!
//! Every tunnel adapter reports its progress through the same closed set of
//! states, so the session engine and UI clients never need to know which
//! protocol is active. The state names mirror OpenVPN's management
//! interface, which is the richest of the supported status sources; the
//! WireGuard adapter only ever emits the subset it can observe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Supported tunnel protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpnType {
    OpenVpn,
    WireGuard,
}

impl fmt::Display for VpnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnType::OpenVpn => write!(f, "OpenVPN"),
            VpnType::WireGuard => write!(f, "WireGuard"),
        }
    }
}

/// Connection state of a tunnel.
///
/// Every adapter emits at least `Disconnected` -> `Connecting` -> ... ->
/// `Connected` -> `Exiting` -> `Disconnected`. The intermediate states are
/// optional, but when emitted they follow the declaration order
/// monotonically within a single connect attempt (a reconnection resets the
/// sequence to `Connecting` or `Reconnecting`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    Disconnected,
    /// Initial state of a starting connection.
    Connecting,
    /// Waiting for the initial response from the server.
    Wait,
    /// Authenticating with the server.
    Auth,
    /// Downloading configuration options from the server.
    GetConfig,
    /// Assigning an IP address to the virtual network interface.
    AssignIp,
    /// Adding routes to the system.
    AddRoutes,
    /// Initialization sequence completed.
    Connected,
    /// A restart has occurred.
    Reconnecting,
    TcpConnect,
    /// A graceful exit is in progress. Terminal for the attempt.
    Exiting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Disconnected => "DISCONNECTED",
            State::Connecting => "CONNECTING",
            State::Wait => "WAIT",
            State::Auth => "AUTH",
            State::GetConfig => "GETCONFIG",
            State::AssignIp => "ASSIGNIP",
            State::AddRoutes => "ADDROUTES",
            State::Connected => "CONNECTED",
            State::Reconnecting => "RECONNECTING",
            State::TcpConnect => "TCP_CONNECT",
            State::Exiting => "EXITING",
        };
        f.write_str(s)
    }
}

/// Error returned when a status string does not name a known state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unexpected state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for State {
    type Err = ParseStateError;

    /// Parses a protocol status token into a [`State`].
    ///
    /// Surrounding whitespace and trailing punctuation are ignored, and the
    /// underscore spellings (`GET_CONFIG`, `ASSIGN_IP`, `ADD_ROUTES`) used by
    /// some OpenVPN builds are accepted as aliases. `DISCONNECTED` is never
    /// produced by a successful parse; the adapters synthesize it themselves.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim_matches(|c: char| c.is_whitespace() || matches!(c, ';' | ',' | '.'));
        match token {
            "CONNECTING" => Ok(State::Connecting),
            "WAIT" => Ok(State::Wait),
            "AUTH" => Ok(State::Auth),
            "GETCONFIG" | "GET_CONFIG" => Ok(State::GetConfig),
            "ASSIGNIP" | "ASSIGN_IP" => Ok(State::AssignIp),
            "ADDROUTES" | "ADD_ROUTES" => Ok(State::AddRoutes),
            "CONNECTED" => Ok(State::Connected),
            "RECONNECTING" => Ok(State::Reconnecting),
            "TCP_CONNECT" => Ok(State::TcpConnect),
            "EXITING" => Ok(State::Exiting),
            _ => Err(ParseStateError(token.to_string())),
        }
    }
}

/// A state change plus the attributes that are meaningful for it.
///
/// The `client_*`/`server_*`/`is_tcp`/`exit_server_id`/`is_can_pause`
/// fields are populated only for [`State::Connected`]; `is_auth_error` only
/// for [`State::Exiting`]. The constructors keep that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub state: State,
    pub description: String,
    pub vpn_type: VpnType,
    /// Unix time (seconds). Stamped by the session engine on emission.
    pub time: i64,
    pub is_tcp: bool,
    pub client_ip: Option<IpAddr>,
    pub client_port: u16,
    pub server_ip: Option<IpAddr>,
    pub server_port: u16,
    pub exit_server_id: String,
    pub is_can_pause: bool,
    pub is_auth_error: bool,
    /// Protocol-opaque reason tag, e.g. the retry cause of a reconnection
    /// ("tls-error", "init_instance"). UI clients use it to decide whether
    /// to retry with a different port.
    pub state_additional_info: String,
}

impl StateInfo {
    /// New state record for any state other than `Connected`.
    pub fn new(vpn_type: VpnType, state: State, description: impl Into<String>) -> Self {
        StateInfo {
            state,
            description: description.into(),
            vpn_type,
            time: 0,
            is_tcp: false,
            client_ip: None,
            client_port: 0,
            server_ip: None,
            server_port: 0,
            exit_server_id: String::new(),
            is_can_pause: false,
            is_auth_error: false,
            state_additional_info: String::new(),
        }
    }

    /// New `Connected` record with all connection attributes.
    #[allow(clippy::too_many_arguments)]
    pub fn connected(
        vpn_type: VpnType,
        is_tcp: bool,
        client_ip: Option<IpAddr>,
        client_port: u16,
        server_ip: Option<IpAddr>,
        server_port: u16,
        is_can_pause: bool,
    ) -> Self {
        StateInfo {
            is_tcp,
            client_ip,
            client_port,
            server_ip,
            server_port,
            is_can_pause,
            ..StateInfo::new(vpn_type, State::Connected, "")
        }
    }

    /// New `Exiting` record, optionally flagged as an authentication failure.
    pub fn exiting(vpn_type: VpnType, description: impl Into<String>, is_auth_error: bool) -> Self {
        StateInfo {
            is_auth_error,
            ..StateInfo::new(vpn_type, State::Exiting, description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_every_state_except_disconnected() {
        let states = [
            State::Connecting,
            State::Wait,
            State::Auth,
            State::GetConfig,
            State::AssignIp,
            State::AddRoutes,
            State::Connected,
            State::Reconnecting,
            State::TcpConnect,
            State::Exiting,
        ];
        for state in states {
            let parsed: State = state.to_string().parse().unwrap();
            assert_eq!(parsed, state, "round trip failed for {state}");
        }
    }

    #[test]
    fn parse_accepts_underscore_aliases() {
        assert_eq!("GET_CONFIG".parse::<State>().unwrap(), State::GetConfig);
        assert_eq!("ASSIGN_IP".parse::<State>().unwrap(), State::AssignIp);
        assert_eq!("ADD_ROUTES".parse::<State>().unwrap(), State::AddRoutes);
    }

    #[test]
    fn parse_trims_whitespace_and_punctuation() {
        assert_eq!("  CONNECTED;,.".parse::<State>().unwrap(), State::Connected);
        assert_eq!("\tWAIT \t".parse::<State>().unwrap(), State::Wait);
    }

    #[test]
    fn parse_never_yields_disconnected() {
        let err = "DISCONNECTED".parse::<State>().unwrap_err();
        assert!(err.to_string().contains("unexpected state"));
    }

    #[test]
    fn parse_rejects_unknown_tokens() {
        assert!("HANDSHAKING".parse::<State>().is_err());
        assert!("".parse::<State>().is_err());
    }

    #[test]
    fn states_are_ordered_for_monotonicity_checks() {
        assert!(State::Connecting < State::Connected);
        assert!(State::Connected < State::Exiting);
        assert!(State::Wait < State::Auth);
    }

    #[test]
    fn ordinary_state_info_has_no_connected_fields() {
        let info = StateInfo::new(VpnType::WireGuard, State::Connecting, "starting");
        assert!(info.client_ip.is_none());
        assert!(info.server_ip.is_none());
        assert_eq!(info.client_port, 0);
        assert_eq!(info.server_port, 0);
        assert!(!info.is_can_pause);
        assert!(!info.is_auth_error);
    }

    #[test]
    fn connected_state_info_carries_all_attributes() {
        let info = StateInfo::connected(
            VpnType::OpenVpn,
            true,
            Some("10.8.0.2".parse().unwrap()),
            41363,
            Some("203.0.113.9".parse().unwrap()),
            443,
            true,
        );
        assert_eq!(info.state, State::Connected);
        assert!(info.is_tcp);
        assert_eq!(info.client_port, 41363);
        assert_eq!(info.server_port, 443);
        assert!(info.is_can_pause);
        assert!(!info.is_auth_error);
    }

    #[test]
    fn exiting_state_info_flags_auth_errors() {
        let info = StateInfo::exiting(VpnType::OpenVpn, "auth-failure", true);
        assert_eq!(info.state, State::Exiting);
        assert!(info.is_auth_error);
        assert!(info.client_ip.is_none());
    }

    #[test]
    fn vpn_type_display_is_stable() {
        assert_eq!(VpnType::OpenVpn.to_string(), "OpenVPN");
        assert_eq!(VpnType::WireGuard.to_string(), "WireGuard");
    }
}
