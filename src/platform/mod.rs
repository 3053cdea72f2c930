//! Contracts toward the privileged platform helpers.
//!
//! The daemon binaries provide per-OS implementations of these traits; the
//! core only depends on the behavior described here.

use log::debug;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::process::Command;

/// System-wide DNS override applied around tunnel bringup and teardown.
pub trait DnsOverride: Send + Sync {
    /// Installs `dns` as the forced resolver. `interface_ip` is the local
    /// tunnel address, needed on platforms where the resolver has to be
    /// bound to the tunnel interface.
    fn set(&self, dns: IpAddr, interface_ip: Option<IpAddr>) -> io::Result<()>;

    /// Removes the forced resolver.
    fn clear(&self) -> io::Result<()>;
}

/// Blocking execution of privileged helper programs (tunnel installers).
pub trait SubprocessRunner: Send + Sync {
    fn exec(&self, env: &[(String, String)], program: &Path, args: &[&str]) -> io::Result<()>;
}

/// Advisory signal that outbound connectivity is intentionally blocked
/// (e.g. by the firewall in kill-switch mode).
pub trait ConnectivityProbe: Send + Sync {
    fn is_blocked(&self) -> bool;
}

/// Windows CREATE_NO_WINDOW flag, keeps helper invocations from flashing
/// console windows.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a Command that won't show a console window on Windows.
pub fn hidden_command(program: &Path) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

/// Default [`SubprocessRunner`] backed by the system shell.
pub struct SystemRunner;

impl SubprocessRunner for SystemRunner {
    fn exec(&self, env: &[(String, String)], program: &Path, args: &[&str]) -> io::Result<()> {
        debug!("exec: {} {}", program.display(), args.join(" "));

        let mut cmd = hidden_command(program);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let status = cmd.status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", program.display(), status),
            ));
        }
        Ok(())
    }
}
