//! Ephemeral port allocation for the supervised application.
//!
//! The port is found by binding port 0 on loopback and releasing the
//! listener right away so the child can bind the same number. Between the
//! release and the child's bind another process may take the port; the child
//! then fails to start, the proxy keeps serving the startup page and the next
//! file change restarts it on a fresh port. That window is accepted rather
//! than papered over.

use crate::error::SupervisorError;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Address the child application listens on.
pub const APP_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Find a currently free loopback port.
pub fn allocate_port() -> Result<u16, SupervisorError> {
    let listener = TcpListener::bind(SocketAddr::from((APP_HOST, 0)))
        .map_err(SupervisorError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(SupervisorError::PortAllocation)?
        .port();
    drop(listener);
    Ok(port)
}
