//! Wire types and error taxonomy of the control-plane API.

use serde::{Deserialize, Serialize};

/// Envelope status: the request was processed successfully.
pub const CODE_SUCCESS: i32 = 200;
/// Envelope status: the account has reached its session limit.
pub const CODE_SESSION_LIMIT_REACHED: i32 = 602;

/// Generic response envelope every endpoint shares. Decoded first; the
/// typed body is decoded only when `status` says there is one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub message: String,
}

/// API client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dial, TLS (including a pin miss), read/write or timeout failure.
    #[error("API request failed: {0}")]
    Transport(String),

    /// The response could not be interpreted. `raw` keeps the body for
    /// diagnostics.
    #[error("failed to deserialize API response: {reason}")]
    Protocol { reason: String, raw: String },

    /// The server answered with a non-success envelope.
    #[error("API error {status}: {message}")]
    Api { status: i32, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the session registration call, which has a structured
/// session-limit outcome on top of the generic taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SessionNewError {
    #[error("session limit reached: {}", .envelope.message)]
    LimitReached {
        info: SessionNewErrorLimitResponse,
        envelope: ApiErrorResponse,
    },

    #[error(transparent)]
    Api(#[from] Error),
}

// --- requests ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SessionNewRequest {
    pub account_id: String,
    pub public_key: String,
    pub force_login: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub captcha_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub captcha: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub confirmation_2fa: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusRequest {
    pub session: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDeleteRequest {
    pub session: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireGuardKeySetRequest {
    pub session: String,
    pub public_key: String,
    pub connected_public_key: String,
}

// --- responses --------------------------------------------------------------

/// Subscription state of the account, as reported by the control plane.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub active_until: i64,
    #[serde(default)]
    pub current_plan: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub is_renewable: bool,
    #[serde(default)]
    pub will_auto_rebill: bool,
    #[serde(default)]
    pub is_on_free_trial: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub upgradable: bool,
    #[serde(default)]
    pub upgrade_to_plan: String,
    #[serde(default)]
    pub upgrade_to_url: String,
    #[serde(default)]
    pub limit: i32,
}

/// WireGuard address assignment inside a session registration response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireGuardAssignment {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionNewResponse {
    #[serde(default)]
    pub status: i32,
    pub token: String,
    #[serde(default)]
    pub vpn_username: String,
    #[serde(default)]
    pub vpn_password: String,
    #[serde(default)]
    pub service_status: ServiceStatus,
    #[serde(default)]
    pub wireguard: WireGuardAssignment,
}

/// Body of the session-limit envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionNewErrorLimitResponse {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: SessionLimitData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionLimitData {
    #[serde(default)]
    pub limit: i32,
    #[serde(default)]
    pub current_plan: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub upgradable: bool,
    #[serde(default)]
    pub upgrade_to_plan: String,
    #[serde(default)]
    pub upgrade_to_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatusResponse {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub service_status: ServiceStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionWireGuardResponse {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoLookupResponse {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub is_vpn_server: bool,
}

// --- server list ------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireGuardServerHostInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub local_ip: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireGuardServerInfo {
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub hosts: Vec<WireGuardServerHostInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenVpnServerInfo {
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// Alternate control-plane addresses advertised with the server list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiHostsInfo {
    #[serde(default, rename = "ips")]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfigInfo {
    #[serde(default)]
    pub api: ApiHostsInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersInfoResponse {
    #[serde(default)]
    pub wireguard: Vec<WireGuardServerInfo>,
    #[serde(default)]
    pub openvpn: Vec<OpenVpnServerInfo>,
    #[serde(default)]
    pub config: ApiConfigInfo,
}
