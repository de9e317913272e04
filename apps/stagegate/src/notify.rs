//! Supervisor notification over `$NOTIFY_SOCKET`.
//!
//! The coordinator tells the supervisor when its gates are bound (`READY=1`)
//! and keeps a one-line `STATUS=` current while stages run. Notification is
//! best effort: a missing or broken socket is logged and otherwise ignored.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

/// Environment variable naming the supervisor's notification socket.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Path(PathBuf),
    /// Linux abstract namespace, written as `@name` in the environment.
    Abstract(Vec<u8>),
}

/// Sends state changes to the supervisor.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    target: Option<Target>,
}

impl Notifier {
    /// Notifier for `$NOTIFY_SOCKET`, or a no-op when unset or disabled.
    #[must_use]
    pub fn from_env(enabled: bool) -> Self {
        if !enabled {
            return Self::default();
        }
        match std::env::var(NOTIFY_SOCKET_ENV) {
            Ok(addr) if !addr.is_empty() => Self::for_address(&addr),
            _ => Self::default(),
        }
    }

    /// Notifier for an explicit socket address (`/path` or `@abstract`).
    #[must_use]
    pub fn for_address(addr: &str) -> Self {
        let target = match addr.strip_prefix('@') {
            Some(name) => Target::Abstract(name.as_bytes().to_vec()),
            None => Target::Path(PathBuf::from(addr)),
        };
        Self {
            target: Some(target),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// All gates are bound; shims may connect.
    pub fn ready(&self, status: &str) {
        self.send(&format!("READY=1\nSTATUS={}", status));
    }

    pub fn status(&self, status: &str) {
        self.send(&format!("STATUS={}", status));
    }

    pub fn stopping(&self) {
        self.send("STOPPING=1");
    }

    fn send(&self, payload: &str) {
        let Some(target) = &self.target else {
            return;
        };
        if let Err(e) = send_datagram(target, payload.as_bytes()) {
            tracing::debug!(error = %e, "Supervisor notification failed");
        }
    }
}

fn send_datagram(target: &Target, payload: &[u8]) -> std::io::Result<usize> {
    let socket = UnixDatagram::unbound()?;
    match target {
        Target::Path(path) => socket.send_to(payload, path),
        Target::Abstract(name) => send_abstract(&socket, name, payload),
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &[u8], payload: &[u8]) -> std::io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
    socket.send_to_addr(payload, &addr)
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, _name: &[u8], _payload: &[u8]) -> std::io::Result<usize> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract notify sockets require Linux",
    ))
}
