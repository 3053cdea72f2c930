//! OpenVPN tunnel adapter.
//!
//! The tunnel runs as an external `openvpn` child process. Its
//! management-style `>STATE:` lines are read from stdout, parsed through
//! the normalized state model and forwarded into the state sink. Pause
//! tears the process down keeping the parameters; resume and restart
//! rebuild it identically.

use crate::platform::{hidden_command, DnsOverride};
use crate::vpn::state::{State, StateInfo, VpnType};
use crate::vpn::{Error, Result, Tunnel};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SUPERVISION_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Pause,
    Resume,
}

/// Parameters of one OpenVPN connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub username: String,
    pub password: String,
    pub host: IpAddr,
    pub port: u16,
    pub use_tcp: bool,
    /// Provider profile carrying certificates and protocol options.
    pub config_path: PathBuf,
}

/// A running child process plus the channel its stdout lines arrive on.
struct ProcessHandle {
    child: Child,
    lines: Receiver<String>,
}

/// OpenVPN tunnel adapter. Single-use: one `connect` per instance.
pub struct OpenVpn {
    binary_path: PathBuf,
    /// Scratch file the credentials are written to for the child; removed
    /// on every exit path.
    auth_file_path: PathBuf,
    params: ConnectionParams,
    dns: Arc<dyn DnsOverride>,

    manual_dns: Mutex<Option<IpAddr>>,
    op_tx: Mutex<Option<Sender<Operation>>>,
    paused: AtomicBool,
    restart_required: AtomicBool,
    disconnect_requested: AtomicBool,
    running: AtomicBool,
}

impl OpenVpn {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        auth_file_path: impl Into<PathBuf>,
        params: ConnectionParams,
        dns: Arc<dyn DnsOverride>,
    ) -> Self {
        OpenVpn {
            binary_path: binary_path.into(),
            auth_file_path: auth_file_path.into(),
            params,
            dns,
            manual_dns: Mutex::new(None),
            op_tx: Mutex::new(None),
            paused: AtomicBool::new(false),
            restart_required: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    fn require_operation(&self, op: Operation) {
        let tx = self.op_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(op);
        }
    }

    fn spawn_process(&self) -> Result<ProcessHandle> {
        std::fs::write(
            &self.auth_file_path,
            format!("{}\n{}\n", self.params.username, self.params.password),
        )
        .map_err(|e| Error::Configuration(format!("failed to save credentials file: {e}")))?;

        let proto = if self.params.use_tcp { "tcp-client" } else { "udp" };

        let mut cmd = hidden_command(&self.binary_path);
        cmd.arg("--config")
            .arg(&self.params.config_path)
            .arg("--remote")
            .arg(self.params.host.to_string())
            .arg(self.params.port.to_string())
            .arg("--proto")
            .arg(proto)
            .arg("--auth-user-pass")
            .arg(&self.auth_file_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Connection(format!("failed to start openvpn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("openvpn stdout is not available".into()))?;

        let (tx, rx) = unbounded();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // Dropping the sender signals EOF to the supervision loop.
        });

        info!("OpenVPN process started");
        Ok(ProcessHandle { child, lines: rx })
    }

    fn terminate(&self, proc: &mut ProcessHandle) {
        if let Err(e) = proc.child.kill() {
            warn!("failed to stop openvpn process: {e}");
        }
        let _ = proc.child.wait();
    }

    /// Parses one stdout line; anything that is not a `>STATE:` report is
    /// ignored.
    fn handle_status_line(&self, line: &str, state_sink: &Sender<StateInfo>) {
        let Some(payload) = line.strip_prefix(">STATE:") else {
            return;
        };

        // >STATE:<time>,<name>,<description>,<local-ip>,<remote-ip>
        //        [,<remote-port>,<local-ip>,<local-port>]
        let fields: Vec<&str> = payload.split(',').collect();
        if fields.len() < 2 {
            return;
        }

        let state = match fields[1].parse::<State>() {
            Ok(state) => state,
            Err(e) => {
                warn!("ignoring status line: {e}");
                return;
            }
        };
        let description = fields.get(2).copied().unwrap_or("");

        match state {
            State::Connected => {
                let client_ip: Option<IpAddr> = fields.get(3).and_then(|s| s.parse().ok());
                let server_ip: Option<IpAddr> = fields.get(4).and_then(|s| s.parse().ok());
                let server_port = fields
                    .get(5)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(self.params.port);
                let client_port = fields.get(7).and_then(|s| s.parse().ok()).unwrap_or(0);

                // Announce the tunnel as up only after the DNS override has
                // been put in place. Override failures are not fatal.
                match *self.manual_dns.lock() {
                    Some(dns) => {
                        if let Err(e) = self.dns.set(dns, client_ip) {
                            warn!("failed to apply DNS override: {e}");
                        }
                    }
                    None => {
                        if let Err(e) = self.dns.clear() {
                            warn!("failed to clear DNS override: {e}");
                        }
                    }
                }

                let _ = state_sink.send(StateInfo::connected(
                    VpnType::OpenVpn,
                    self.params.use_tcp,
                    client_ip,
                    client_port,
                    server_ip,
                    server_port,
                    true,
                ));
            }
            State::Exiting => {
                let is_auth_error = description.contains("auth-failure");
                let _ = state_sink.send(StateInfo::exiting(VpnType::OpenVpn, description, is_auth_error));
            }
            State::Reconnecting => {
                // The description is the retry cause ("tls-error",
                // "init_instance", ...); clients pick ports based on it.
                let mut info = StateInfo::new(VpnType::OpenVpn, State::Reconnecting, "");
                info.state_additional_info = description.to_string();
                let _ = state_sink.send(info);
            }
            _ => {
                let _ = state_sink.send(StateInfo::new(VpnType::OpenVpn, state, description));
            }
        }
    }

    fn connect_inner(&self, state_sink: &Sender<StateInfo>) -> Result<()> {
        let (op_tx, op_rx) = bounded(1);
        *self.op_tx.lock() = Some(op_tx);

        let _ = state_sink.send(StateInfo::new(VpnType::OpenVpn, State::Connecting, ""));

        let mut proc = self.spawn_process()?;
        self.running.store(true, Ordering::SeqCst);

        loop {
            // Owned handle: the arms below replace `proc` on resume/restart.
            let lines = proc.lines.clone();

            select! {
                recv(lines) -> line => match line {
                    Ok(line) => self.handle_status_line(&line, state_sink),
                    Err(_) => {
                        // stdout closed: the process exited on its own.
                        let status = proc.child.wait().map_err(Error::Io)?;
                        if status.success() || self.disconnect_requested.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        return Err(Error::Connection(format!(
                            "openvpn exited unexpectedly ({status})"
                        )));
                    }
                },
                recv(op_rx) -> op => match op {
                    Ok(Operation::Pause) => {
                        self.paused.store(true, Ordering::SeqCst);
                        info!("Pausing...");
                        self.terminate(&mut proc);
                        info!("Paused");

                        // Park until something other than another pause
                        // arrives; queued pause requests collapse.
                        let mut op = Operation::Pause;
                        while op == Operation::Pause {
                            match op_rx.recv() {
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
                            match self.spawn_process() {
                                Ok(fresh) => {
                                    proc = fresh;
                                    self.paused.store(false, Ordering::SeqCst);
                                    info!("Resumed");
                                }
                                Err(e) => {
                                    error!("failed to resume connection: {e}");
                                    self.paused.store(false, Ordering::SeqCst);
                                    return Err(e);
                                }
                            }
                        }
                    }
                    // Resume without a preceding pause.
                    Ok(Operation::Resume) | Err(_) => {}
                },
                default(SUPERVISION_POLL_INTERVAL) => {
                    if self.disconnect_requested.load(Ordering::SeqCst) {
                        self.terminate(&mut proc);
                        return Ok(());
                    }

                    if self.restart_required.swap(false, Ordering::SeqCst) {
                        let _ = state_sink.send(StateInfo::new(
                            VpnType::OpenVpn,
                            State::Reconnecting,
                            "Reconnecting with new connection parameters",
                        ));
                        info!("Restarting...");
                        self.terminate(&mut proc);
                        proc = self.spawn_process()?;
                    }
                }
            }
        }
    }
}

impl Tunnel for OpenVpn {
    fn vpn_type(&self) -> VpnType {
        VpnType::OpenVpn
    }

    fn init(&self) -> Result<()> {
        // Nothing survives a crashed child process; no residue to clean.
        Ok(())
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
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.dns.clear() {
            error!("failed to remove DNS override: {e}");
        }
        if self.auth_file_path.exists() {
            let _ = std::fs::remove_file(&self.auth_file_path);
        }
        info!("Connection stopped");
        let _ = state_sink.send(StateInfo::new(VpnType::OpenVpn, State::Disconnected, ""));

        result
    }

    fn disconnect(&self) -> Result<()> {
        self.disconnect_requested.store(true, Ordering::SeqCst);

        // Wake the supervision loop if it is parked in the paused state;
        // otherwise the next poll observes the flag.
        self.require_operation(Operation::Resume);
        Ok(())
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
        if self.running.load(Ordering::SeqCst) {
            info!("Connection will be restarted due to DNS configuration change...");
            self.restart_required.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn reset_manual_dns(&self) -> Result<()> {
        {
            let mut current = self.manual_dns.lock();
            if current.is_none() {
                return Ok(());
            }
            *current = None;
        }
        if self.running.load(Ordering::SeqCst) {
            info!("Connection will be restarted due to DNS configuration change...");
            self.restart_required.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn destination_ip(&self) -> Option<IpAddr> {
        Some(self.params.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::io;

    struct NoopDns;

    impl DnsOverride for NoopDns {
        fn set(&self, _dns: IpAddr, _interface_ip: Option<IpAddr>) -> io::Result<()> {
            Ok(())
        }

        fn clear(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn make_adapter() -> OpenVpn {
        OpenVpn::new(
            "/usr/sbin/openvpn",
            std::env::temp_dir().join("vantage-ovpn-test-auth.txt"),
            ConnectionParams {
                username: "vpnuser".into(),
                password: "vpnpass".into(),
                host: "203.0.113.9".parse().unwrap(),
                port: 2049,
                use_tcp: false,
                config_path: PathBuf::from("/etc/vantage/client.ovpn"),
            },
            Arc::new(NoopDns),
        )
    }

    #[test]
    fn status_lines_flow_through_the_state_parser() {
        let adapter = make_adapter();
        let (tx, rx) = unbounded();

        adapter.handle_status_line(">STATE:1608558742,WAIT,,,", &tx);
        adapter.handle_status_line(">STATE:1608558743,AUTH,,,", &tx);
        adapter.handle_status_line(">STATE:1608558744,GET_CONFIG,,,", &tx);

        assert_eq!(rx.try_recv().unwrap().state, State::Wait);
        assert_eq!(rx.try_recv().unwrap().state, State::Auth);
        assert_eq!(rx.try_recv().unwrap().state, State::GetConfig);
    }

    #[test]
    fn connected_line_carries_endpoints() {
        let adapter = make_adapter();
        let (tx, rx) = unbounded();

        adapter.handle_status_line(
            ">STATE:1608558742,CONNECTED,SUCCESS,10.8.0.2,203.0.113.9,2049,192.168.1.5,41363",
            &tx,
        );

        let info = rx.try_recv().unwrap();
        assert_eq!(info.state, State::Connected);
        assert_eq!(info.client_ip, Some("10.8.0.2".parse().unwrap()));
        assert_eq!(info.server_ip, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(info.server_port, 2049);
        assert_eq!(info.client_port, 41363);
        assert!(info.is_can_pause);
        assert!(!info.is_tcp);
    }

    #[test]
    fn auth_failure_is_flagged_on_exiting() {
        let adapter = make_adapter();
        let (tx, rx) = unbounded();

        adapter.handle_status_line(">STATE:1608558742,EXITING,auth-failure,,", &tx);

        let info = rx.try_recv().unwrap();
        assert_eq!(info.state, State::Exiting);
        assert!(info.is_auth_error);
    }

    #[test]
    fn reconnecting_reason_lands_in_additional_info() {
        let adapter = make_adapter();
        let (tx, rx) = unbounded();

        adapter.handle_status_line(">STATE:1608558742,RECONNECTING,tls-error,,", &tx);

        let info = rx.try_recv().unwrap();
        assert_eq!(info.state, State::Reconnecting);
        assert_eq!(info.state_additional_info, "tls-error");
    }

    #[test]
    fn non_state_lines_are_ignored() {
        let adapter = make_adapter();
        let (tx, rx) = unbounded();

        adapter.handle_status_line("Tue Dec 21 13:32:22 2021 TUN/TAP device opened", &tx);
        adapter.handle_status_line(">LOG:1608558742,I,Initialization Sequence Completed", &tx);
        adapter.handle_status_line(">STATE:1608558742,HANDSHAKING,,,", &tx);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connect_after_disconnect_fails_immediately() {
        let adapter = make_adapter();
        adapter.disconnect().unwrap();

        let (tx, _rx) = unbounded();
        match adapter.connect(&tx) {
            Err(Error::Connection(_)) => {}
            other => panic!("expected a connection error, got {other:?}"),
        }
    }

    #[test]
    fn pause_without_connection_is_a_noop() {
        let adapter = make_adapter();
        adapter.pause().unwrap();
        assert!(!adapter.is_paused());
    }

    #[test]
    fn manual_dns_is_deduplicated() {
        let adapter = make_adapter();
        let dns: IpAddr = "10.0.0.1".parse().unwrap();

        adapter.set_manual_dns(dns).unwrap();
        adapter.running.store(true, Ordering::SeqCst);
        adapter.set_manual_dns(dns).unwrap();
        // The duplicate must not schedule a restart.
        assert!(!adapter.restart_required.load(Ordering::SeqCst));

        adapter.set_manual_dns("10.0.0.2".parse().unwrap()).unwrap();
        assert!(adapter.restart_required.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_manual_dns_without_override_is_a_noop() {
        let adapter = make_adapter();
        adapter.running.store(true, Ordering::SeqCst);
        adapter.reset_manual_dns().unwrap();
        assert!(!adapter.restart_required.load(Ordering::SeqCst));
    }
}
