//! WireGuard tunnel adapter.
//!
//! The tunnel itself runs as an OS-managed service installed by the stock
//! WireGuard tooling; this module owns the service lifecycle and the
//! supervision loop that multiplexes pause/resume/restart/disconnect
//! against it. The scratch configuration file is generated per connect
//! attempt and removed on teardown.

mod service;

pub use service::{ServiceManager, ServiceState};

#[cfg(windows)]
pub use service::WindowsServiceManager;

use crate::platform::{DnsOverride, SubprocessRunner};
use crate::vpn::state::{State, StateInfo, VpnType};
use crate::vpn::{Error, Result, Tunnel};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// The tunnel service name is shared by every connection, so install and
// uninstall must never run concurrently; racing the OS service manager
// leaves half-registered services behind.
static GLOBAL_SERVICE_LOCK: Mutex<()> = Mutex::new(());

const SUPERVISION_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BRINGUP_POLL_INTERVAL: Duration = Duration::from_millis(10);
const UNINSTALL_RETRY_INITIAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Pause,
    Resume,
}

/// Parameters of one WireGuard connect attempt. Immutable once the attempt
/// starts; a DNS override change forces a rebuild instead of mutating them.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub private_key: String,
    /// Address assigned to the local tunnel interface.
    pub client_local_ip: IpAddr,
    pub host_public_key: String,
    pub host_ip: IpAddr,
    pub host_port: u16,
    /// Internal address of the exit host; doubles as the in-tunnel DNS.
    pub host_local_ip: IpAddr,
}

/// Bringup/teardown deadlines. The defaults are generous to accommodate
/// very slow machines.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub service_install: Duration,
    pub service_start: Duration,
    pub service_uninstall: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            service_install: Duration::from_secs(3 * 60),
            service_start: Duration::from_secs(5 * 60),
            service_uninstall: Duration::from_secs(3 * 60),
        }
    }
}

/// WireGuard tunnel adapter. Single-use: one `connect` per instance.
pub struct WireGuard {
    binary_path: PathBuf,
    config_path: PathBuf,
    params: ConnectionParams,
    service: Arc<dyn ServiceManager>,
    runner: Arc<dyn SubprocessRunner>,
    dns: Arc<dyn DnsOverride>,
    timeouts: Timeouts,

    manual_dns: Mutex<Option<IpAddr>>,
    op_tx: Mutex<Option<Sender<Operation>>>,
    paused: AtomicBool,
    restart_required: AtomicBool,
    disconnect_requested: AtomicBool,
}

impl WireGuard {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        params: ConnectionParams,
        service: Arc<dyn ServiceManager>,
        runner: Arc<dyn SubprocessRunner>,
        dns: Arc<dyn DnsOverride>,
    ) -> Self {
        WireGuard {
            binary_path: binary_path.into(),
            config_path: config_path.into(),
            params,
            service,
            runner,
            dns,
            timeouts: Timeouts::default(),
            manual_dns: Mutex::new(None),
            op_tx: Mutex::new(None),
            paused: AtomicBool::new(false),
            restart_required: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn tunnel_name(&self) -> String {
        self.config_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("vantage")
            .to_string()
    }

    fn service_name(&self) -> String {
        format!("WireGuardTunnel${}", self.tunnel_name())
    }

    fn generate_config(&self) -> String {
        let dns = self.manual_dns.lock().unwrap_or(self.params.host_local_ip);

        // The two half-space routes are equivalent to 0.0.0.0/0, but the
        // catch-all form would activate the tunnel service's built-in
        // firewall; the daemon runs its own.
        format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = {}\n\
             DNS = {}\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             Endpoint = {}:{}\n\
             AllowedIPs = 128.0.0.0/1, 0.0.0.0/1\n",
            self.params.private_key,
            self.params.client_local_ip,
            dns,
            self.params.host_public_key,
            self.params.host_ip,
            self.params.host_port,
        )
    }

    fn require_operation(&self, op: Operation) {
        let tx = self.op_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(op);
        }
    }

    fn notify_connected(&self, state_sink: &Sender<StateInfo>) {
        let info = StateInfo::connected(
            VpnType::WireGuard,
            false,
            Some(self.params.client_local_ip),
            0,
            Some(self.params.host_ip),
            self.params.host_port,
            true,
        );
        let _ = state_sink.send(info);
    }

    /// Installs the tunnel service, waits for it to run, applies the DNS
    /// override and announces `Connected`. On failure the half-installed
    /// service is removed again.
    fn install_service(&self, state_sink: &Sender<StateInfo>) -> Result<()> {
        let result = self.install_service_locked(state_sink);
        if result.is_err() {
            info!("Failed to install service. Uninstalling...");
            if let Err(e) = self.uninstall_service() {
                error!("failed to uninstall service after unsuccessful connect: {e}");
            }
        }
        result
    }

    fn install_service_locked(&self, state_sink: &Sender<StateInfo>) -> Result<()> {
        let _guard = GLOBAL_SERVICE_LOCK.lock();

        info!("Connecting...");

        std::fs::write(&self.config_path, self.generate_config()).map_err(|e| {
            Error::ServiceLifecycle(format!("failed to save tunnel config: {e}"))
        })?;

        info!("Installing service...");
        let config_arg = self.config_path.to_string_lossy().into_owned();
        self.runner
            .exec(&[], &self.binary_path, &["/installtunnelservice", &config_arg])
            .map_err(|e| Error::ServiceLifecycle(format!("failed to install tunnel service: {e}")))?;

        let service_name = self.service_name();

        info!("Waiting for service install...");
        let deadline = Instant::now() + self.timeouts.service_install;
        loop {
            if !matches!(
                self.service.query(&service_name),
                Ok(ServiceState::NotInstalled) | Err(_)
            ) {
                info!("Service installed");
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::ServiceLifecycle("service not installed (timeout)".into()));
            }
            thread::sleep(BRINGUP_POLL_INTERVAL);
        }

        info!("Waiting for service start...");
        let deadline = Instant::now() + self.timeouts.service_start;
        loop {
            match self.service.query(&service_name) {
                Ok(ServiceState::Running) => {
                    info!("Service started");
                    break;
                }
                Ok(ServiceState::Stopped) => {
                    return Err(Error::ServiceLifecycle("tunnel service stopped during start".into()));
                }
                Ok(_) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::ServiceLifecycle("service not started (timeout)".into()));
            }
            thread::sleep(BRINGUP_POLL_INTERVAL);
        }

        // The tunnel interface already uses the right DNS; the override hook
        // additionally covers non-tunnel interfaces and keeps the DNS status
        // visible to clients. Failures are not fatal to the attempt.
        match *self.manual_dns.lock() {
            Some(dns) => {
                if let Err(e) = self.dns.set(dns, Some(self.params.client_local_ip)) {
                    warn!("failed to apply DNS override: {e}");
                }
            }
            None => {
                if let Err(e) = self.dns.clear() {
                    warn!("failed to clear DNS override: {e}");
                }
            }
        }

        info!("Connection started");
        self.notify_connected(state_sink);

        Ok(())
    }

    fn uninstall_service(&self) -> Result<()> {
        let _guard = GLOBAL_SERVICE_LOCK.lock();

        let service_name = self.service_name();
        match self.service.query(&service_name) {
            // Nothing to uninstall.
            Ok(ServiceState::NotInstalled) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                return Err(Error::ServiceLifecycle(format!(
                    "service manager unavailable: {e}"
                )))
            }
        }

        info!("Uninstalling service...");
        let tunnel_name = self.tunnel_name();
        self.runner
            .exec(&[], &self.binary_path, &["/uninstalltunnelservice", &tunnel_name])
            .map_err(|e| Error::ServiceLifecycle(format!("failed to uninstall tunnel service: {e}")))?;

        // The uninstall command occasionally has no effect; reissue it with
        // an increasing interval while the service keeps running.
        let mut last_retry = Instant::now();
        let mut next_retry_after = UNINSTALL_RETRY_INITIAL;

        let deadline = Instant::now() + self.timeouts.service_uninstall;
        loop {
            match self.service.query(&service_name) {
                Ok(ServiceState::NotInstalled) => break,
                Ok(ServiceState::Running) if last_retry.elapsed() > next_retry_after => {
                    info!("Retry: uninstalling service...");
                    self.runner
                        .exec(&[], &self.binary_path, &["/uninstalltunnelservice", &tunnel_name])
                        .map_err(|e| {
                            Error::ServiceLifecycle(format!(
                                "failed to uninstall tunnel service: {e}"
                            ))
                        })?;
                    last_retry = Instant::now();
                    next_retry_after *= 2;
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::ServiceLifecycle("service not uninstalled (timeout)".into()));
            }
            thread::sleep(SUPERVISION_POLL_INTERVAL);
        }

        info!("Service uninstalled");
        Ok(())
    }

    fn disconnect_internal(&self) -> Result<()> {
        info!("Disconnecting...");

        // Wake the supervision loop if it is parked in the paused state.
        self.require_operation(Operation::Resume);

        self.uninstall_service()
    }

    fn request_restart_if_running(&self) -> Result<()> {
        match self.service.query(&self.service_name()) {
            Ok(ServiceState::Running) => {
                info!("Connection will be restarted due to DNS configuration change...");
                self.restart_required.store(true, Ordering::SeqCst);
                Ok(())
            }
            // Not running: the stored value applies on the next connect.
            Ok(_) => Ok(()),
            Err(e) => Err(Error::ServiceLifecycle(format!(
                "service manager unavailable: {e}"
            ))),
        }
    }

    fn connect_inner(&self, state_sink: &Sender<StateInfo>) -> Result<()> {
        let _ = state_sink.send(StateInfo::new(VpnType::WireGuard, State::Connecting, ""));

        // Clear out anything left from a previous run before installing.
        if let Err(e) = self.disconnect_internal() {
            return Err(Error::ServiceLifecycle(format!(
                "failed to clean up before new connection: {e}"
            )));
        }

        self.install_service(state_sink)?;

        if self.disconnect_requested.load(Ordering::SeqCst) {
            // The disconnect raced the bringup; tear straight back down.
            info!("Disconnection was requested");
            return self.uninstall_service();
        }

        let (op_tx, op_rx) = bounded(1);
        *self.op_tx.lock() = Some(op_tx);

        self.supervise(op_rx, state_sink)
    }

    /// Supervision loop: runs for the lifetime of the tunnel service,
    /// polling its state and applying pause/resume/restart requests.
    fn supervise(&self, ops: Receiver<Operation>, state_sink: &Sender<StateInfo>) -> Result<()> {
        let service_name = self.service_name();

        loop {
            match self.service.query(&service_name) {
                Ok(ServiceState::NotInstalled) | Ok(ServiceState::Stopped) => return Ok(()),
                Ok(_) | Err(_) => {}
            }

            match ops.try_recv() {
                Ok(Operation::Pause) => {
                    self.paused.store(true, Ordering::SeqCst);
                    info!("Pausing...");

                    if let Err(e) = self.uninstall_service() {
                        error!("failed to pause connection (disconnection error): {e}");
                        self.paused.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                    info!("Paused");

                    // Park until something other than another pause arrives;
                    // queued-up pause requests collapse into this one.
                    let mut op = Operation::Pause;
                    while op == Operation::Pause {
                        match ops.recv() {
                            Ok(next) => op = next,
                            Err(_) => break,
                        }
                    }

                    if self.disconnect_requested.load(Ordering::SeqCst) {
                        self.paused.store(false, Ordering::SeqCst);
                        return Ok(());
                    }

                    if op == Operation::Resume {
                        info!("Resuming...");
                        if let Err(e) = self.install_service(state_sink) {
                            error!("failed to resume connection (new connection error): {e}");
                            self.paused.store(false, Ordering::SeqCst);
                            return Err(e);
                        }
                        self.paused.store(false, Ordering::SeqCst);
                        info!("Resumed");
                    }
                }
                // Resume without a preceding pause.
                Ok(Operation::Resume) => {}
                Err(_) => {}
            }

            // A configuration change (manual DNS) requested a rebuild.
            if self.restart_required.swap(false, Ordering::SeqCst) {
                let _ = state_sink.send(StateInfo::new(
                    VpnType::WireGuard,
                    State::Reconnecting,
                    "Reconnecting with new connection parameters",
                ));

                info!("Restarting...");
                if let Err(e) = self.uninstall_service() {
                    error!("failed to restart connection (disconnection error): {e}");
                } else if let Err(e) = self.install_service(state_sink) {
                    error!("failed to restart connection (new connection error): {e}");
                } else {
                    info!("Connection restarted");
                }
            }

            thread::sleep(SUPERVISION_POLL_INTERVAL);
        }
    }
}

impl Tunnel for WireGuard {
    fn vpn_type(&self) -> VpnType {
        VpnType::WireGuard
    }

    fn init(&self) -> Result<()> {
        match self.service.query(&self.service_name()) {
            Ok(ServiceState::NotInstalled) => Ok(()),
            Ok(_) => {
                warn!("The tunnel service is installed (it is not expected). Uninstalling it...");
                self.uninstall_service()
            }
            Err(e) => Err(Error::ServiceLifecycle(format!(
                "service manager unavailable: {e}"
            ))),
        }
    }

    fn connect(&self, state_sink: &Sender<StateInfo>) -> Result<()> {
        if self.disconnect_requested.load(Ordering::SeqCst) {
            return Err(Error::Connection(
                "disconnection already requested for this tunnel; initialize a new one to reconnect"
                    .into(),
            ));
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.connect_inner(state_sink)))
            .unwrap_or_else(|_| Err(Error::Connection("tunnel supervision panicked".into())));

        // Cleanup runs on every exit path: success, error or panic.
        *self.op_tx.lock() = None;
        if let Err(e) = self.dns.clear() {
            error!("failed to remove DNS override: {e}");
        }
        if self.config_path.exists() {
            let _ = std::fs::remove_file(&self.config_path);
        }
        info!("Connection stopped");
        let _ = state_sink.send(StateInfo::new(VpnType::WireGuard, State::Disconnected, ""));

        result
    }

    fn disconnect(&self) -> Result<()> {
        self.disconnect_requested.store(true, Ordering::SeqCst);
        self.disconnect_internal()
    }

    fn pause(&self) -> Result<()> {
        self.require_operation(Operation::Pause);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.require_operation(Operation::Resume);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_manual_dns(&self, dns: IpAddr) -> Result<()> {
        {
            let mut current = self.manual_dns.lock();
            if *current == Some(dns) {
                return Ok(());
            }
            *current = Some(dns);
        }
        self.request_restart_if_running()
    }

    fn reset_manual_dns(&self) -> Result<()> {
        {
            let mut current = self.manual_dns.lock();
            if current.is_none() {
                return Ok(());
            }
            *current = None;
        }
        self.request_restart_if_running()
    }

    fn destination_ip(&self) -> Option<IpAddr> {
        Some(self.params.host_ip)
    }
}

/// Path of the scratch configuration file for a given tunnel name inside
/// the daemon's writable directory.
pub fn config_file_path(scratch_dir: &Path, tunnel_name: &str) -> PathBuf {
    scratch_dir.join(format!("{tunnel_name}.conf"))
}
