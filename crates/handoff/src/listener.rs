//! Listener acquisition.
//!
//! A cold process binds fresh sockets; a warm process adopts the slots its
//! parent passed down, located through the decoded `_idx` variables. The
//! mode is fixed for the lifetime of the process. A warm process never
//! falls back to binding: a name missing from the inherited environment is
//! a deployment error and fails hard.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{HandoffError, Result};
use crate::generation::Startup;
use crate::registry::{self, DescriptorKind};

/// Stream networks that can be handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6, whichever the address resolves to first.
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(HandoffError::UnsupportedNetwork {
                network: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
        }
    }
}

impl Startup {
    /// Obtain the listener named `name`.
    ///
    /// Cold: binds `address` and registers a duplicate of the socket.
    /// Warm: adopts the inherited slot for `name` (`address` is ignored) and
    /// registers it the first time the name is seen in this generation.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire(&mut self, name: &str, network: &str, address: &str) -> Result<TcpListener> {
        self.acquire_kind(name, network, address, DescriptorKind::Socket)
    }

    /// Same as [`Startup::acquire`], tagging the descriptor as an HTTP listener.
    pub fn acquire_http(&mut self, name: &str, network: &str, address: &str) -> Result<TcpListener> {
        self.acquire_kind(name, network, address, DescriptorKind::Http)
    }

    fn acquire_kind(
        &mut self,
        name: &str,
        network: &str,
        address: &str,
        kind: DescriptorKind,
    ) -> Result<TcpListener> {
        let network: Network = network.parse()?;
        registry::validate_name(name)?;

        let listener = if self.is_warm() {
            self.acquire_inherited(name, kind)?
        } else {
            self.acquire_fresh(name, network, address, kind)?
        };

        if let Ok(addr) = listener.local_addr() {
            if !network.accepts(&addr) {
                warn!(%addr, %network, name, "Listener address family does not match requested network");
            }
        }
        Ok(listener)
    }

    fn acquire_fresh(
        &mut self,
        name: &str,
        network: Network,
        address: &str,
        kind: DescriptorKind,
    ) -> Result<TcpListener> {
        if self.registry.contains(name) {
            return Err(HandoffError::DuplicateName {
                name: name.to_string(),
            });
        }

        let std_listener = bind(network, address).map_err(|source| HandoffError::Bind {
            name: name.to_string(),
            address: address.to_string(),
            source,
        })?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        // The registry keeps its own (close-on-exec) duplicate for handoff.
        let handle = listener.as_fd().try_clone_to_owned()?;
        let index = self.registry.register(name, handle, kind)?;

        info!(
            index,
            name,
            addr = ?listener.local_addr().ok(),
            %network,
            "Bound listener"
        );
        Ok(listener)
    }

    fn acquire_inherited(&mut self, name: &str, kind: DescriptorKind) -> Result<TcpListener> {
        // Already adopted in this generation: hand out another duplicate.
        if let Ok(entry) = self.registry.lookup(name) {
            let handle = entry.handle().try_clone_to_owned()?;
            return into_listener(handle);
        }

        let fd = self.env.resolve_handoff_slot(name)?;
        if self.registry.all().iter().any(|e| e.raw_fd() == fd) {
            // Two names pointing at one slot would mean two owners of one fd.
            return Err(HandoffError::InvalidDescriptor {
                name: name.to_string(),
                fd,
            });
        }

        let handle = adopt_inherited(name, fd)?;
        let listener_handle = handle.try_clone()?;
        let index = self.registry.register(name, handle, kind)?;
        let listener = into_listener(listener_handle)?;

        info!(
            fd,
            index,
            name,
            addr = ?listener.local_addr().ok(),
            "Inherited listener from parent process"
        );
        Ok(listener)
    }
}

/// Bind the first resolved address of `address` that belongs to `network`.
fn bind(network: Network, address: &str) -> io::Result<std::net::TcpListener> {
    let candidates: Vec<SocketAddr> = address
        .to_socket_addrs()?
        .filter(|addr| network.accepts(addr))
        .collect();
    if candidates.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} does not resolve to a {network} address"),
        ));
    }
    std::net::TcpListener::bind(&candidates[..])
}

/// Take ownership of an inherited slot after checking it is a socket.
///
/// The slot arrives without close-on-exec; it is set again so the
/// descriptor only reaches later children through the registry.
fn adopt_inherited(name: &str, fd: RawFd) -> Result<OwnedFd> {
    if !validate_fd(fd) {
        return Err(HandoffError::InvalidDescriptor {
            name: name.to_string(),
            fd,
        });
    }

    // SAFETY: fstat confirmed `fd` is an open socket, and the registry check
    // in `acquire_inherited` guarantees nothing else in this process owns it.
    let handle = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(handle.as_raw_fd())?;
    Ok(handle)
}

fn into_listener(handle: OwnedFd) -> Result<TcpListener> {
    let std_listener = std::net::TcpListener::from(handle);
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener)?)
}

/// True if `fd` is open and refers to a socket.
fn validate_fd(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
