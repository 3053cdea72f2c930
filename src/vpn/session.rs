//! Session engine.
//!
//! Supervises at most one tunnel adapter at a time: runs its blocking
//! `connect` on a worker thread, stamps and forwards the state stream into
//! the caller's channel, and relays control operations to whichever adapter
//! is currently active.

use crate::vpn::state::StateInfo;
use crate::vpn::{Error, Result, Tunnel};
use crossbeam_channel::Sender;
use log::warn;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Owns the active tunnel for the duration of one connection.
#[derive(Default)]
pub struct SessionEngine {
    active: Mutex<Option<Arc<dyn Tunnel>>>,
}

impl SessionEngine {
    pub fn new() -> Self {
        SessionEngine {
            active: Mutex::new(None),
        }
    }

    /// Runs one connection to completion. Blocks until the tunnel has fully
    /// stopped; the caller owns `state_sink` and must drain it promptly.
    ///
    /// Only one connection may be active per engine; a second call while one
    /// is running fails immediately.
    pub fn connect(&self, tunnel: Arc<dyn Tunnel>, state_sink: Sender<StateInfo>) -> Result<()> {
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(Error::Connection("another connection is already active".into()));
            }
            *active = Some(tunnel.clone());
        }

        let result = self.run(tunnel, &state_sink);

        *self.active.lock() = None;
        result
    }

    fn run(&self, tunnel: Arc<dyn Tunnel>, state_sink: &Sender<StateInfo>) -> Result<()> {
        tunnel.init()?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = {
            let tunnel = tunnel.clone();
            thread::spawn(move || tunnel.connect(&tx))
        };

        // The adapter closes its end when `connect` returns, which ends this
        // forwarding loop.
        for mut info in rx {
            info.time = unix_now();
            if state_sink.send(info).is_err() {
                // The consumer went away; keep draining so the adapter can
                // finish its teardown.
                warn!("state consumer disappeared; draining remaining states");
            }
        }

        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(Error::Connection("tunnel worker panicked".into())),
        }
    }

    fn with_active<T>(&self, default: T, f: impl FnOnce(&Arc<dyn Tunnel>) -> T) -> T {
        match self.active.lock().as_ref() {
            Some(tunnel) => f(tunnel),
            None => default,
        }
    }

    /// Terminates the active connection. Idempotent; no-op when idle.
    pub fn disconnect(&self) -> Result<()> {
        self.with_active(Ok(()), |t| t.disconnect())
    }

    /// Pauses the active connection; no-op when idle or not connected.
    pub fn pause(&self) -> Result<()> {
        self.with_active(Ok(()), |t| t.pause())
    }

    /// Resumes a paused connection; no-op otherwise.
    pub fn resume(&self) -> Result<()> {
        self.with_active(Ok(()), |t| t.resume())
    }

    pub fn is_paused(&self) -> bool {
        self.with_active(false, |t| t.is_paused())
    }

    pub fn set_manual_dns(&self, dns: IpAddr) -> Result<()> {
        self.with_active(Ok(()), |t| t.set_manual_dns(dns))
    }

    pub fn reset_manual_dns(&self) -> Result<()> {
        self.with_active(Ok(()), |t| t.reset_manual_dns())
    }

    /// Peer address of the active tunnel, for firewall whitelisting.
    pub fn destination_ip(&self) -> Option<IpAddr> {
        self.with_active(None, |t| t.destination_ip())
    }

    /// Relays a routing-table change notification to the active adapter.
    pub fn notify_routing_changed(&self) {
        if let Err(e) = self.with_active(Ok(()), |t| t.on_routing_changed()) {
            warn!("routing change handling failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::state::{State, VpnType};
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Adapter double that emits a scripted state sequence and waits for a
    /// disconnect signal before finishing.
    struct ScriptedTunnel {
        hold_until_disconnect: bool,
        disconnected: AtomicBool,
    }

    impl ScriptedTunnel {
        fn new(hold_until_disconnect: bool) -> Arc<Self> {
            Arc::new(ScriptedTunnel {
                hold_until_disconnect,
                disconnected: AtomicBool::new(false),
            })
        }
    }

    impl Tunnel for ScriptedTunnel {
        fn vpn_type(&self) -> VpnType {
            VpnType::WireGuard
        }

        fn init(&self) -> Result<()> {
            Ok(())
        }

        fn connect(&self, state_sink: &Sender<StateInfo>) -> Result<()> {
            let _ = state_sink.send(StateInfo::new(VpnType::WireGuard, State::Connecting, ""));
            let _ = state_sink.send(StateInfo::connected(
                VpnType::WireGuard,
                false,
                Some("172.16.0.2".parse().unwrap()),
                0,
                Some("203.0.113.9".parse().unwrap()),
                51820,
                true,
            ));
            while self.hold_until_disconnect && !self.disconnected.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
            }
            let _ = state_sink.send(StateInfo::new(VpnType::WireGuard, State::Disconnected, ""));
            Ok(())
        }

        fn disconnect(&self) -> Result<()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn pause(&self) -> Result<()> {
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            Ok(())
        }

        fn is_paused(&self) -> bool {
            false
        }

        fn set_manual_dns(&self, _dns: IpAddr) -> Result<()> {
            Ok(())
        }

        fn reset_manual_dns(&self) -> Result<()> {
            Ok(())
        }

        fn destination_ip(&self) -> Option<IpAddr> {
            Some("203.0.113.9".parse().unwrap())
        }
    }

    #[test]
    fn forwards_states_with_timestamps() {
        let engine = SessionEngine::new();
        let (tx, rx) = unbounded();

        engine.connect(ScriptedTunnel::new(false), tx).unwrap();

        let states: Vec<StateInfo> = rx.try_iter().collect();
        assert_eq!(states.len(), 3);
        assert_eq!(states[0].state, State::Connecting);
        assert_eq!(states[1].state, State::Connected);
        assert_eq!(states[2].state, State::Disconnected);
        for info in &states {
            assert!(info.time > 0, "state {:?} was not timestamped", info.state);
        }
    }

    #[test]
    fn rejects_a_second_connection_while_active() {
        let engine = Arc::new(SessionEngine::new());
        let tunnel = ScriptedTunnel::new(true);
        let (tx, rx) = unbounded();

        let worker = {
            let engine = engine.clone();
            let tunnel = tunnel.clone();
            thread::spawn(move || engine.connect(tunnel, tx))
        };

        // Wait until the first connection is up.
        loop {
            let info = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if info.state == State::Connected {
                break;
            }
        }

        let (tx2, _rx2) = unbounded();
        match engine.connect(ScriptedTunnel::new(false), tx2) {
            Err(Error::Connection(_)) => {}
            other => panic!("expected a connection error, got {other:?}"),
        }

        engine.disconnect().unwrap();
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn engine_is_reusable_after_a_connection_ends() {
        let engine = SessionEngine::new();

        let (tx, _rx) = unbounded();
        engine.connect(ScriptedTunnel::new(false), tx).unwrap();

        let (tx2, rx2) = unbounded();
        engine.connect(ScriptedTunnel::new(false), tx2).unwrap();
        assert!(rx2.try_iter().any(|info| info.state == State::Connected));
    }

    #[test]
    fn control_operations_are_noops_when_idle() {
        let engine = SessionEngine::new();
        engine.disconnect().unwrap();
        engine.pause().unwrap();
        engine.resume().unwrap();
        assert!(!engine.is_paused());
        assert!(engine.destination_ip().is_none());
        engine.notify_routing_changed();
    }
}
