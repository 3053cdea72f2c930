//! Control-plane API client.
//!
//! All requests ride on the pinned HTTPS transport. API-host requests fail
//! over from DNS to a provider-advertised list of alternate raw addresses,
//! remembering the last address that worked; update-host requests are
//! DNS-only. Responses share a `{status, message}` envelope that is decoded
//! before the endpoint-specific body.

pub mod pinning;
pub mod types;

use crate::platform::ConnectivityProbe;
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use types::{
    ApiErrorResponse, Error, GeoLookupResponse, Result, ServersInfoResponse, ServiceStatus,
    SessionDeleteRequest, SessionNewError, SessionNewErrorLimitResponse, SessionNewRequest,
    SessionNewResponse, SessionStatusRequest, SessionStatusResponse, SessionWireGuardResponse,
    WireGuardKeySetRequest, CODE_SESSION_LIMIT_REACHED, CODE_SUCCESS,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("vantage-daemon/", env!("CARGO_PKG_VERSION"));

const API_HOST: &str = "api.vantagevpn.net";
const UPDATE_HOST: &str = "repo.vantagevpn.net";

const SERVERS_PATH: &str = "v4/servers.json";
const SESSION_NEW_PATH: &str = "v4/session/new";
const SESSION_STATUS_PATH: &str = "v4/session/status";
const SESSION_DELETE_PATH: &str = "v4/session/delete";
const WG_KEY_SET_PATH: &str = "v4/session/wg/set";
const GEO_LOOKUP_PATH: &str = "v4/geo-lookup";

/// SHA-256(SPKI) pins accepted from `api.vantagevpn.net`.
pub const API_PIN_SET: &[&str] = &[
    "iRHkSbdOY7rrPVGKlxnJZgZVm6AfWa7IBWmfMHQa9h4=",
    "JtnVcdAgBAP5pPtAf4AGBO5qZHQGPsBzQ09AyRRaGZs=",
    "np2s1r2Rt1l3XKs1opN6qYwUc2pD1WZkkeG2h/vIUT8=",
];

/// SHA-256(SPKI) pins accepted from `repo.vantagevpn.net`.
pub const UPDATE_PIN_SET: &[&str] = &[
    "g0sAzZfYpNklIgKpg3aDBCOXmVkemcLvQjBlN0CYCTQ=",
    "KCRO2PBZcV5vHvFs1QJGSK2iEmy0ZNW7NGY5nvkDuEs=",
];

/// Host classes the client talks to. Each carries its own pin set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    Api,
    Update,
}

impl HostClass {
    fn host(self) -> &'static str {
        match self {
            HostClass::Api => API_HOST,
            HostClass::Update => UPDATE_HOST,
        }
    }
}

/// Resolves a UI-visible request alias to its host class and path.
pub fn request_alias(alias: &str) -> Option<(HostClass, &'static str)> {
    Some(match alias {
        "geo-lookup" => (HostClass::Api, GEO_LOOKUP_PATH),

        // Linux manifests predate the per-platform layout and kept their
        // repository path.
        "updateInfo_Linux" => (HostClass::Update, "stable/_update_info/update.json"),
        "updateSign_Linux" => {
            (HostClass::Update, "stable/_update_info/update.json.sign.sha256.base64")
        }
        "updateInfo_macOS" => (HostClass::Update, "macos/update.json"),
        "updateSign_macOS" => (HostClass::Update, "macos/update.json.sign.sha256.base64"),
        "updateInfo_Windows" => (HostClass::Update, "windows/update.json"),
        "updateSign_Windows" => (HostClass::Update, "windows/update.json.sign.sha256.base64"),

        "updateInfo_manual_Linux" => (HostClass::Update, "stable/_update_info/update_manual.json"),
        "updateSign_manual_Linux" => (
            HostClass::Update,
            "stable/_update_info/update_manual.json.sign.sha256.base64",
        ),
        "updateInfo_manual_macOS" => (HostClass::Update, "macos/update_manual.json"),
        "updateSign_manual_macOS" => {
            (HostClass::Update, "macos/update_manual.json.sign.sha256.base64")
        }
        "updateInfo_manual_Windows" => (HostClass::Update, "windows/update_manual.json"),
        "updateSign_manual_Windows" => {
            (HostClass::Update, "windows/update_manual.json.sign.sha256.base64")
        }

        _ => return None,
    })
}

#[derive(Default)]
struct FailoverState {
    alternate_ips: Vec<IpAddr>,
    last_good_ip: Option<IpAddr>,
}

/// Control-plane client. One instance lives for the whole process.
pub struct Api {
    api_tls: ClientConfig,
    update_tls: ClientConfig,
    state: Mutex<FailoverState>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl Api {
    pub fn new() -> Result<Self> {
        let api_tls = pinning::client_config(API_PIN_SET, false, API_HOST)
            .map_err(|e| Error::Transport(format!("failed to build TLS configuration: {e}")))?;
        let update_tls = pinning::client_config(UPDATE_PIN_SET, false, UPDATE_HOST)
            .map_err(|e| Error::Transport(format!("failed to build TLS configuration: {e}")))?;

        Ok(Api {
            api_tls,
            update_tls,
            state: Mutex::new(FailoverState::default()),
            probe: None,
        })
    }

    /// Attach the firewall's connectivity probe; when connectivity is
    /// intentionally blocked, the alternate-address walk is skipped.
    pub fn with_connectivity_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn is_alternate_ips_initialized(&self) -> bool {
        !self.state.lock().alternate_ips.is_empty()
    }

    /// Installs the provider-advertised alternate address list. Entries that
    /// do not parse are dropped. The cached last-good address is kept only
    /// if it is still part of the new list.
    pub fn set_alternate_ips(&self, ips: &[String]) {
        if ips.is_empty() {
            warn!("Unable to set alternate API IP list. List is empty");
        }

        let parsed: Vec<IpAddr> = ips.iter().filter_map(|s| s.parse().ok()).collect();

        let mut state = self.state.lock();
        if let Some(last) = state.last_good_ip {
            if !parsed.contains(&last) {
                state.last_good_ip = None;
            }
        }
        state.alternate_ips = parsed;
    }

    fn snapshot(&self) -> (Option<IpAddr>, Vec<IpAddr>) {
        let state = self.state.lock();
        (state.last_good_ip, state.alternate_ips.clone())
    }

    fn save_last_good(&self, ip: Option<IpAddr>) {
        self.state.lock().last_good_ip = ip;
    }

    /// One HTTP client per attempt. `dial_ip` redirects the connection to a
    /// literal address while the URL, SNI and certificate pinning keep using
    /// the canonical host name.
    fn client_for(
        &self,
        host_class: HostClass,
        dial_ip: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<reqwest::Client> {
        let tls = match host_class {
            HostClass::Api => self.api_tls.clone(),
            HostClass::Update => self.update_tls.clone(),
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .use_preconfigured_tls(tls);

        if let Some(ip) = dial_ip {
            builder = builder.resolve(host_class.host(), SocketAddr::new(ip, 443));
        }

        builder
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))
    }

    async fn send_once(
        &self,
        host_class: HostClass,
        dial_ip: Option<IpAddr>,
        path: &str,
        method: Method,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let client = self.client_for(host_class, dial_ip, timeout)?;
        let url = format!("https://{}/{}", host_class.host(), path);

        let mut request = client.request(method, &url);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {e}")))?;

        Ok(bytes.to_vec())
    }

    /// Request with failover. The order for the API host is: last-good
    /// address, canonical DNS name, then each alternate address. Update-host
    /// requests go through DNS only.
    async fn request_raw(
        &self,
        host_class: HostClass,
        path: &str,
        method: Method,
        body: Option<&[u8]>,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<u8>> {
        let timeout = timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        if host_class == HostClass::Update {
            return self
                .send_once(host_class, None, path, method, body, timeout)
                .await;
        }

        let (last_good, alternates) = self.snapshot();

        if let Some(ip) = last_good {
            if let Ok(data) = self
                .send_once(host_class, Some(ip), path, method.clone(), body, timeout)
                .await
            {
                // Keep the cached address; it still works.
                return Ok(data);
            }
        }

        match self
            .send_once(host_class, None, path, method.clone(), body, timeout)
            .await
        {
            Ok(data) => {
                self.save_last_good(None);
                Ok(data)
            }
            Err(first_err) => {
                warn!("Failed to access {API_HOST}");

                if let Some(probe) = &self.probe {
                    if probe.is_blocked() {
                        // Connectivity is deliberately blocked; the
                        // alternates would fail the same way.
                        return Err(first_err);
                    }
                }

                for (i, ip) in alternates.iter().enumerate() {
                    info!("Trying to use alternate API IP #{i}...");
                    match self
                        .send_once(host_class, Some(*ip), path, method.clone(), body, timeout)
                        .await
                    {
                        Ok(data) => {
                            self.save_last_good(Some(*ip));
                            info!("Alternate API IP #{i} succeeded");
                            return Ok(data);
                        }
                        Err(e) => warn!("Alternate API IP #{i} failed: {e}"),
                    }
                }

                Err(first_err)
            }
        }
    }

    // --- endpoints ----------------------------------------------------------

    /// Downloads the server list and installs the advertised alternate API
    /// addresses.
    pub async fn download_servers_list(&self) -> Result<ServersInfoResponse> {
        let data = self
            .request_raw(HostClass::Api, SERVERS_PATH, Method::GET, None, None)
            .await?;
        let servers: ServersInfoResponse = decode_typed(&data)?;

        self.set_alternate_ips(&servers.config.api.ip_addresses);
        Ok(servers)
    }

    /// Registers a new session. A session-limit refusal is returned as the
    /// structured [`SessionNewError::LimitReached`] variant.
    pub async fn session_new(
        &self,
        request: &SessionNewRequest,
    ) -> std::result::Result<SessionNewResponse, SessionNewError> {
        let body = encode_body(request)?;
        let data = self
            .request_raw(
                HostClass::Api,
                SESSION_NEW_PATH,
                Method::POST,
                Some(&body),
                None,
            )
            .await?;
        parse_session_new(&data)
    }

    pub async fn session_status(&self, session: &str) -> Result<ServiceStatus> {
        let body = encode_body(&SessionStatusRequest {
            session: session.to_string(),
        })?;
        let data = self
            .request_raw(
                HostClass::Api,
                SESSION_STATUS_PATH,
                Method::POST,
                Some(&body),
                None,
            )
            .await?;
        parse_session_status(&data)
    }

    pub async fn session_delete(&self, session: &str) -> Result<()> {
        let body = encode_body(&SessionDeleteRequest {
            session: session.to_string(),
        })?;
        let data = self
            .request_raw(
                HostClass::Api,
                SESSION_DELETE_PATH,
                Method::POST,
                Some(&body),
                None,
            )
            .await?;

        let envelope = decode_envelope(&data)?;
        if envelope.status != CODE_SUCCESS {
            return Err(Error::Api {
                status: envelope.status,
                message: envelope.message,
            });
        }
        Ok(())
    }

    /// Rotates the WireGuard key of a session; returns the assigned local
    /// tunnel address.
    pub async fn wireguard_key_set(
        &self,
        session: &str,
        new_public_key: &str,
        connected_public_key: &str,
    ) -> Result<IpAddr> {
        let body = encode_body(&WireGuardKeySetRequest {
            session: session.to_string(),
            public_key: new_public_key.to_string(),
            connected_public_key: connected_public_key.to_string(),
        })?;
        let data = self
            .request_raw(
                HostClass::Api,
                WG_KEY_SET_PATH,
                Method::POST,
                Some(&body),
                None,
            )
            .await?;
        parse_wireguard_key_set(&data)
    }

    pub async fn geo_lookup(&self, timeout_ms: u64) -> Result<GeoLookupResponse> {
        let data = self
            .request_raw(
                HostClass::Api,
                GEO_LOOKUP_PATH,
                Method::GET,
                None,
                Some(timeout_ms),
            )
            .await?;
        decode_typed(&data)
    }

    /// Raw request by endpoint alias; used for the signed update manifests,
    /// whose bytes are handed to the caller for verification.
    pub async fn request_by_alias(&self, alias: &str) -> Result<Vec<u8>> {
        let (host_class, path) = request_alias(alias).ok_or_else(|| Error::Protocol {
            reason: format!("unexpected request alias: {alias}"),
            raw: String::new(),
        })?;
        self.request_raw(host_class, path, Method::GET, None, None)
            .await
    }
}

// --- response interpretation -----------------------------------------------

fn encode_body<T: Serialize>(request: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(request).map_err(|e| Error::Protocol {
        reason: format!("failed to serialize request: {e}"),
        raw: String::new(),
    })
}

fn decode_envelope(data: &[u8]) -> Result<ApiErrorResponse> {
    serde_json::from_slice(data).map_err(|e| Error::Protocol {
        reason: e.to_string(),
        raw: String::from_utf8_lossy(data).into_owned(),
    })
}

fn decode_typed<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Protocol {
        reason: e.to_string(),
        raw: String::from_utf8_lossy(data).into_owned(),
    })
}

fn parse_session_new(data: &[u8]) -> std::result::Result<SessionNewResponse, SessionNewError> {
    let envelope = decode_envelope(data)?;

    match envelope.status {
        CODE_SUCCESS => Ok(decode_typed(data)?),
        CODE_SESSION_LIMIT_REACHED => {
            let info: SessionNewErrorLimitResponse = decode_typed(data)?;
            Err(SessionNewError::LimitReached { info, envelope })
        }
        _ => Err(SessionNewError::Api(Error::Api {
            status: envelope.status,
            message: envelope.message,
        })),
    }
}

fn parse_session_status(data: &[u8]) -> Result<ServiceStatus> {
    let envelope = decode_envelope(data)?;
    if envelope.status != CODE_SUCCESS {
        return Err(Error::Api {
            status: envelope.status,
            message: envelope.message,
        });
    }

    let response: SessionStatusResponse = decode_typed(data)?;
    Ok(response.service_status)
}

fn parse_wireguard_key_set(data: &[u8]) -> Result<IpAddr> {
    let response: SessionWireGuardResponse = decode_typed(data)?;
    if response.status != CODE_SUCCESS {
        return Err(Error::Api {
            status: response.status,
            message: response.message,
        });
    }

    response.ip_address.parse().map_err(|_| Error::Protocol {
        reason: "key rotation response carries no valid local IP".to_string(),
        raw: String::from_utf8_lossy(data).into_owned(),
    })
}
