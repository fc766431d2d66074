//! The listening socket that survives a restart.
//!
//! Only two kinds of listener can be handed off: TCP and unix-domain stream
//! sockets. Anything else is refused when a [`Listener`] is built, so the rest
//! of the crate never has to check again.

use std::fmt;
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{self, sockopt, AddressFamily, SockType, SockaddrLike, SockaddrStorage};

use crate::envelope::Envelope;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listener from `"tcp:<host:port>"`, `"unix:<path>"` or a bare `"<host:port>"`.
    pub fn bind(address: &str) -> Result<Self> {
        match address.split_once(':') {
            Some(("tcp", addr)) => Ok(Listener::Tcp(TcpListener::bind(addr)?)),
            Some(("unix", path)) => Ok(Listener::Unix(UnixListener::bind(path)?)),
            Some((net @ ("udp" | "udp4" | "udp6" | "ip" | "unixgram" | "unixpacket"), _)) => {
                Err(Error::UnsupportedListenerType(net.to_string()))
            }
            _ => Ok(Listener::Tcp(TcpListener::bind(address)?)),
        }
    }

    /// Wrap a descriptor, accepting only listening TCP or unix stream sockets.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        let network = classify(fd.as_fd())?;
        Ok(match network {
            Network::Tcp => Listener::Tcp(TcpListener::from(fd)),
            Network::Unix => Listener::Unix(UnixListener::from(fd)),
        })
    }

    /// Rebuild the listener handed over by a predecessor.
    ///
    /// Takes ownership of the inherited descriptor and marks it close-on-exec
    /// again; the spawner clears that flag for the next successor only.
    pub fn decode(envelope: &Envelope) -> Result<Self> {
        let fd = envelope.fd();
        let mismatch = |reason: String| Error::TypeMismatch {
            fd,
            name: envelope.name().to_string(),
            reason,
        };

        let flags = fcntl(fd, FcntlArg::F_GETFD)
            .map_err(|e| mismatch(format!("descriptor is not open: {e}")))?;
        let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
        fcntl(fd, FcntlArg::F_SETFD(flags))?;

        // SAFETY: the descriptor was verified open above and nothing else in
        // this process refers to it; the predecessor passed it to us.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let listener = match Listener::from_owned_fd(owned) {
            Ok(listener) => listener,
            Err(Error::UnsupportedListenerType(reason)) => return Err(mismatch(reason)),
            Err(e) => return Err(e),
        };

        if let Some(network) = envelope.network() {
            if network != listener.network().as_str() {
                return Err(mismatch(format!(
                    "envelope names a {network} listener, descriptor is {}",
                    listener.network()
                )));
            }
        }
        let addr = listener.addr()?;
        match envelope.address() {
            Some(expected) if expected != addr => {
                warn!("inherited listener address {addr} differs from {expected}")
            }
            _ => debug!("inherited {} listener on {addr} (fd {fd})", listener.network()),
        }
        Ok(listener)
    }

    pub fn network(&self) -> Network {
        match self {
            Listener::Tcp(_) => Network::Tcp,
            Listener::Unix(_) => Network::Unix,
        }
    }

    pub fn addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(l) => Ok(l.local_addr()?.to_string()),
            Listener::Unix(l) => Ok(l
                .local_addr()?
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
        }
    }

    /// Canonical `"<network>:<address>->"` name carried alongside the descriptor.
    pub fn name(&self) -> io::Result<String> {
        Ok(format!("{}:{}->", self.network(), self.addr()?))
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Listener::Tcp(l) => Listener::Tcp(l.try_clone()?),
            Listener::Unix(l) => Listener::Unix(l.try_clone()?),
        })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Shut the socket down for every process holding it, waking blocked
    /// accept calls. Only for a final stop, never around a handoff.
    pub fn shutdown(&self) -> io::Result<()> {
        socket::shutdown(self.as_raw_fd(), socket::Shutdown::Both).map_err(io::Error::from)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Self {
        Listener::Tcp(l)
    }
}

impl From<UnixListener> for Listener {
    fn from(l: UnixListener) -> Self {
        Listener::Unix(l)
    }
}

fn classify(fd: BorrowedFd<'_>) -> Result<Network> {
    let unsupported = |reason: String| Error::UnsupportedListenerType(reason);

    let kind = socket::getsockopt(&fd, sockopt::SockType)
        .map_err(|e| unsupported(format!("not a socket: {e}")))?;
    if kind != SockType::Stream {
        return Err(unsupported(format!("{kind:?} socket")));
    }
    if !socket::getsockopt(&fd, sockopt::AcceptConn)? {
        return Err(unsupported("stream socket is not listening".to_string()));
    }
    let addr: SockaddrStorage = socket::getsockname(fd.as_raw_fd())?;
    match addr.family() {
        Some(AddressFamily::Inet | AddressFamily::Inet6) => Ok(Network::Tcp),
        Some(AddressFamily::Unix) => Ok(Network::Unix),
        other => Err(unsupported(format!("address family {other:?}"))),
    }
}

/// Whether an accept error only reports that the listener was closed or shut
/// down on purpose, as opposed to a genuine accept fault.
pub fn is_closing(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EBADF | Errno::EINVAL)
    )
}
