//! Listening sockets and the accept loop.
//!
//! One thread waits on every listener through a `mio::Poll` and hands each
//! accepted socket to the connection queue. A full queue stalls accepting.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::ServerContext;
use crate::error::{Result, ServerError};
use crate::http::Connection;
use crate::logging::ErrorSource;

/// How long one readiness wait lasts before the stop flag is checked again.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Read timeout on accepted sockets; workers re-check the stop flag this often.
pub(crate) const READ_SLICE: Duration = Duration::from_millis(500);

/// One entry of `listening_ports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Address to bind.
    pub addr: SocketAddr,
    /// `s` suffix: TLS.
    pub tls: bool,
    /// `p` suffix: forward-proxy traffic.
    pub proxy: bool,
}

impl ListenerSpec {
    /// Parse `[ip:]port[s|p]`; IPv6 addresses go in brackets.
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (body, tls, proxy) = match spec.as_bytes().last() {
            Some(b's') => (&spec[..spec.len() - 1], true, false),
            Some(b'p') => (&spec[..spec.len() - 1], false, true),
            _ => (spec, false, false),
        };

        let addr = if body.contains(':') {
            body.parse::<SocketAddr>()
                .map_err(|_| format!("{spec}: expected ip:port"))?
        } else {
            let port = body
                .parse::<u16>()
                .map_err(|_| format!("{spec}: invalid port"))?;
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        };

        Ok(Self { addr, tls, proxy })
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub(crate) struct Listener {
    socket: TcpListener,
    pub local: SocketAddr,
    pub tls: bool,
    pub proxy: bool,
}

impl Listener {
    pub fn bind(spec: &ListenerSpec) -> Result<Self> {
        let socket = TcpListener::bind(spec.addr).map_err(|source| ServerError::BindFailed {
            addr: spec.addr,
            source,
        })?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        tracing::info!(%local, tls = spec.tls, proxy = spec.proxy, "listening");
        Ok(Self {
            socket,
            local,
            tls: spec.tls,
            proxy: spec.proxy,
        })
    }
}

/// Accept on every listener until the server is told to stop.
pub(crate) fn accept_loop(server: &ServerContext, listeners: &[Listener]) -> io::Result<()> {
    let mut poll = Poll::new()?;
    for (i, listener) in listeners.iter().enumerate() {
        let fd = listener.socket.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), Token(i), Interest::READABLE)?;
    }

    let mut events = Events::with_capacity(listeners.len() * 4);
    while !server.stopping() {
        match poll.poll(&mut events, Some(POLL_INTERVAL)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        for event in events.iter() {
            if let Some(listener) = listeners.get(event.token().0) {
                accept_ready(server, listener);
            }
        }
    }
    tracing::debug!("accept loop stopped");
    Ok(())
}

/// Drain the listener's backlog; readiness is edge-triggered.
fn accept_ready(server: &ServerContext, listener: &Listener) {
    loop {
        let (stream, remote) = match listener.socket.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(local = %listener.local, error = %e, "accept failed");
                return;
            }
        };

        if !server.settings.acl.allows(remote.ip()) {
            server.logs.error(
                Some(ErrorSource {
                    remote: remote.ip(),
                    method: "-",
                    uri: "-",
                }),
                "connection refused by access control list",
            );
            continue;
        }

        let prepared = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(READ_SLICE)))
            .and_then(|()| stream.set_nodelay(true));
        if let Err(e) = prepared {
            tracing::warn!(%remote, error = %e, "cannot configure accepted socket");
            continue;
        }

        let conn = Connection {
            stream,
            local: listener.local,
            remote,
            tls: listener.tls,
            proxy: listener.proxy,
        };
        if server.queue.push(conn).is_err() {
            tracing::debug!(%remote, "server stopping, connection dropped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_forms() {
        let spec = ListenerSpec::parse("8080").unwrap();
        assert_eq!(spec.addr, "0.0.0.0:8080".parse().unwrap());
        assert!(!spec.tls && !spec.proxy);

        let spec = ListenerSpec::parse("127.0.0.1:8443s").unwrap();
        assert_eq!(spec.addr, "127.0.0.1:8443".parse().unwrap());
        assert!(spec.tls);

        let spec = ListenerSpec::parse("3128p").unwrap();
        assert!(spec.proxy);
        assert_eq!(spec.addr.port(), 3128);

        let spec = ListenerSpec::parse("[::1]:8080").unwrap();
        assert!(spec.addr.is_ipv6());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ListenerSpec::parse("http").is_err());
        assert!(ListenerSpec::parse("70000").is_err());
        assert!(ListenerSpec::parse("1.2.3:80").is_err());
        assert!(ListenerSpec::parse("").is_err());
    }

    #[test]
    fn bind_reports_the_address() {
        let taken = Listener::bind(&ListenerSpec::parse("127.0.0.1:0").unwrap()).unwrap();
        let again = ListenerSpec {
            addr: taken.local,
            tls: false,
            proxy: false,
        };
        match Listener::bind(&again) {
            Err(ServerError::BindFailed { addr, .. }) => assert_eq!(addr, taken.local),
            other => panic!("expected BindFailed, got {other:?}"),
        }
    }
}
