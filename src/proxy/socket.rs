// src/proxy/socket.rs
//
// TCP_KEEPALIVE tuning on both halves of a forwarded connection. Tokio's
// `TcpStream` doesn't expose keepalive idle-time directly, so this drops
// down to `socket2` on the raw fd/handle.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);

pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    sock.set_tcp_keepalive(&keepalive)
}
