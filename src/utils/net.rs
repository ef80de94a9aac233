use std::io;
use std::net::TcpListener;

/// Asks the OS for a currently unused TCP port on `host`.
///
/// The port is released before returning, so another process may grab it first.
pub fn find_free_port(host: &str) -> io::Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}
