//! OS service manager seam for the WireGuard adapter.

use std::io;

/// Service lifecycle states the supervision loop distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// The service does not exist, or the manager reports it as disabled or
    /// not active.
    NotInstalled,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Read-only view of the OS service manager.
///
/// `Err` means the manager itself is unreachable; a missing service is
/// reported as [`ServiceState::NotInstalled`].
pub trait ServiceManager: Send + Sync {
    fn query(&self, service_name: &str) -> io::Result<ServiceState>;
}

#[cfg(windows)]
pub use self::windows::WindowsServiceManager;

#[cfg(windows)]
mod windows {
    use super::{ServiceManager, ServiceState};
    use std::io;
    use windows_service::service::{ServiceAccess, ServiceState as WinServiceState};
    use windows_service::service_manager::{
        ServiceManager as WinServiceManager, ServiceManagerAccess,
    };

    /// [`ServiceManager`] backed by the Windows service control manager.
    pub struct WindowsServiceManager;

    impl ServiceManager for WindowsServiceManager {
        fn query(&self, service_name: &str) -> io::Result<ServiceState> {
            let manager =
                WinServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            let service = match manager.open_service(service_name, ServiceAccess::QUERY_STATUS) {
                Ok(service) => service,
                Err(_) => return Ok(ServiceState::NotInstalled),
            };

            let status = service
                .query_status()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            Ok(match status.current_state {
                WinServiceState::Running => ServiceState::Running,
                WinServiceState::Stopped => ServiceState::Stopped,
                WinServiceState::StartPending | WinServiceState::ContinuePending => {
                    ServiceState::Starting
                }
                WinServiceState::StopPending
                | WinServiceState::PausePending
                | WinServiceState::Paused => ServiceState::Stopping,
            })
        }
    }
}
