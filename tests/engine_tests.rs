//! Session engine and state model tests.
//!
//! Exercises the public crate surface end to end with a scripted tunnel
//! adapter: state-stream ordering, terminal-state guarantees, engine
//! ownership rules. Run with: cargo test --test engine_tests

use crossbeam_channel::{unbounded, Sender};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vantage_core::vpn::{self, Tunnel};
use vantage_core::{SessionEngine, State, StateInfo, VpnType};

/// Adapter double that walks through a full OpenVPN-style bringup sequence
/// and then waits for disconnect.
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
        VpnType::OpenVpn
    }

    fn init(&self) -> vpn::Result<()> {
        Ok(())
    }

    fn connect(&self, state_sink: &Sender<StateInfo>) -> vpn::Result<()> {
        for state in [
            State::Connecting,
            State::Wait,
            State::Auth,
            State::GetConfig,
            State::AssignIp,
            State::AddRoutes,
        ] {
            let _ = state_sink.send(StateInfo::new(VpnType::OpenVpn, state, ""));
        }
        let _ = state_sink.send(StateInfo::connected(
            VpnType::OpenVpn,
            true,
            Some("10.8.0.2".parse().unwrap()),
            41363,
            Some("203.0.113.9".parse().unwrap()),
            443,
            true,
        ));

        while self.hold_until_disconnect && !self.disconnected.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(10));
        }

        let _ = state_sink.send(StateInfo::exiting(VpnType::OpenVpn, "SIGTERM", false));
        let _ = state_sink.send(StateInfo::new(VpnType::OpenVpn, State::Disconnected, ""));
        Ok(())
    }

    fn disconnect(&self) -> vpn::Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> vpn::Result<()> {
        Ok(())
    }

    fn resume(&self) -> vpn::Result<()> {
        Ok(())
    }

    fn is_paused(&self) -> bool {
        false
    }

    fn set_manual_dns(&self, _dns: IpAddr) -> vpn::Result<()> {
        Ok(())
    }

    fn reset_manual_dns(&self) -> vpn::Result<()> {
        Ok(())
    }

    fn destination_ip(&self) -> Option<IpAddr> {
        Some("203.0.113.9".parse().unwrap())
    }
}

fn run_scripted_connection() -> Vec<StateInfo> {
    let engine = SessionEngine::new();
    let (tx, rx) = unbounded();
    engine.connect(ScriptedTunnel::new(false), tx).unwrap();
    rx.try_iter().collect()
}

mod state_stream_tests {
    use super::*;

    #[test]
    fn full_bringup_sequence_is_monotone() {
        let states = run_scripted_connection();

        // Ignore the trailing teardown when checking connect-attempt order.
        let connect_phase: Vec<State> = states
            .iter()
            .map(|info| info.state)
            .take_while(|state| *state != State::Exiting)
            .collect();

        let mut sorted = connect_phase.clone();
        sorted.sort();
        assert_eq!(connect_phase, sorted, "connect states must be monotone");
    }

    #[test]
    fn stream_ends_disconnected() {
        let states = run_scripted_connection();
        assert_eq!(states.last().unwrap().state, State::Disconnected);
    }

    #[test]
    fn connected_is_emitted_exactly_once_with_full_attributes() {
        let states = run_scripted_connection();
        let connected: Vec<&StateInfo> = states
            .iter()
            .filter(|info| info.state == State::Connected)
            .collect();

        assert_eq!(connected.len(), 1);
        let info = connected[0];
        assert!(info.client_ip.is_some());
        assert!(info.server_ip.is_some());
        assert_ne!(info.client_port, 0);
        assert_ne!(info.server_port, 0);
        assert!(info.is_can_pause);
        assert!(!info.is_auth_error);
    }

    #[test]
    fn non_connected_states_have_no_connection_attributes() {
        let states = run_scripted_connection();
        for info in states.iter().filter(|info| info.state != State::Connected) {
            assert!(info.client_ip.is_none(), "{:?} leaked client_ip", info.state);
            assert!(info.server_ip.is_none(), "{:?} leaked server_ip", info.state);
            assert!(!info.is_can_pause, "{:?} leaked is_can_pause", info.state);
        }
    }

    #[test]
    fn every_emission_is_timestamped() {
        for info in run_scripted_connection() {
            assert!(info.time > 0, "{:?} was not timestamped", info.state);
        }
    }
}

mod engine_ownership_tests {
    use super::*;

    #[test]
    fn one_connection_per_engine() {
        let engine = Arc::new(SessionEngine::new());
        let tunnel = ScriptedTunnel::new(true);
        let (tx, rx) = unbounded();

        let worker = {
            let engine = engine.clone();
            let tunnel = tunnel.clone();
            thread::spawn(move || engine.connect(tunnel, tx))
        };

        loop {
            let info = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if info.state == State::Connected {
                break;
            }
        }

        let (tx2, _rx2) = unbounded();
        assert!(engine.connect(ScriptedTunnel::new(false), tx2).is_err());

        assert_eq!(engine.destination_ip(), Some("203.0.113.9".parse().unwrap()));

        engine.disconnect().unwrap();
        assert!(worker.join().unwrap().is_ok());

        // The slot frees up once the connection is over.
        let (tx3, _rx3) = unbounded();
        assert!(engine.connect(ScriptedTunnel::new(false), tx3).is_ok());
    }

    #[test]
    fn idle_engine_ignores_control_operations() {
        let engine = SessionEngine::new();
        engine.pause().unwrap();
        engine.resume().unwrap();
        engine.disconnect().unwrap();
        assert!(!engine.is_paused());
        assert!(engine.destination_ip().is_none());
    }
}

mod state_model_tests {
    use super::*;

    #[test]
    fn status_tokens_round_trip() {
        for state in [
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
        ] {
            assert_eq!(state.to_string().parse::<State>().unwrap(), state);
        }
    }

    #[test]
    fn state_records_serialize_for_the_ipc_boundary() {
        let info = StateInfo::connected(
            VpnType::WireGuard,
            false,
            Some("172.16.0.2".parse().unwrap()),
            0,
            Some("203.0.113.9".parse().unwrap()),
            51820,
            true,
        );

        let json = serde_json::to_string(&info).unwrap();
        let decoded: StateInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, info);
    }
}
