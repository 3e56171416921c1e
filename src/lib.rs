//! embedserve - an embeddable HTTP/1.1 server
//!
//! Serves static files with ranges and validators, directory listings,
//! CGI programs, server-side includes, a small WebDAV subset, digest
//! authentication and forward proxying. One thread accepts connections into
//! a bounded queue; a fixed pool of workers each runs a whole keep-alive
//! connection at a time.
//!
//! ```no_run
//! use embedserve::{Config, Server};
//!
//! let config = Config::new()
//!     .with("listening_ports", "8080")?
//!     .with("document_root", "/srv/www")?;
//! let mut server = Server::start(config)?;
//! // ... until it is time to go
//! server.stop();
//! # Ok::<(), embedserve::ServerError>(())
//! ```

#![warn(missing_docs)]

pub mod acl;
pub mod builder;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod listener;
mod logging;
pub mod middleware;
mod tls;

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use rustls::ServerConfig;

pub use builder::ServerBuilder;
pub use config::Config;
pub use error::{Result, ServerError};
pub use handlers::auth::set_password;
pub use http::{Method, Request, RequestContext, Response, Status};
pub use middleware::{Chain, Flow, Middleware, Routes};

use config::Settings;
use http::{Connection, ConnectionQueue, ThreadPool, connection};
use listener::Listener;
use logging::Logs;

/// Accepted connections that may wait for a worker before accepting stalls.
const QUEUE_CAPACITY: usize = 20;

/// State shared by the accept thread and every worker.
pub(crate) struct ServerContext {
    pub settings: Settings,
    pub logs: Logs,
    pub queue: Arc<ConnectionQueue<Connection>>,
    pub stop: AtomicBool,
    pub tls: Option<Arc<ServerConfig>>,
    pub middleware: Chain,
}

impl ServerContext {
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A running server. Dropping it stops it.
pub struct Server {
    context: Arc<ServerContext>,
    local_addrs: Vec<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    pool: ThreadPool,
}

impl Server {
    /// Start serving with the built-in handlers only.
    pub fn start(config: Config) -> Result<Self> {
        Self::start_with(config, Chain::new())
    }

    /// Start serving, running `middleware` ahead of the built-in handlers.
    ///
    /// Binds every listener, drops privileges if `run_as_user` is set, opens
    /// the log files and spawns the worker pool and accept thread. Any failure
    /// here aborts the start; nothing is left running.
    pub fn start_with(config: Config, middleware: Chain) -> Result<Self> {
        let settings = config.resolve()?;

        let tls = if settings.listeners.iter().any(|spec| spec.tls) {
            let certificate = settings
                .ssl_certificate
                .as_deref()
                .ok_or_else(|| ServerError::Tls("a TLS listener needs ssl_certificate".to_string()))?;
            Some(tls::build_server_config(certificate, settings.ssl_chain_file.as_deref())?)
        } else {
            None
        };

        let listeners = settings
            .listeners
            .iter()
            .map(Listener::bind)
            .collect::<Result<Vec<_>>>()?;
        let local_addrs = listeners.iter().map(|l| l.local).collect();

        let logs = Logs::open(settings.access_log_file.as_deref(), settings.error_log_file.as_deref())?;

        if let Some(user) = &settings.run_as_user {
            drop_privileges(user)?;
        }

        let threads = settings.num_threads;
        let context = Arc::new(ServerContext {
            settings,
            logs,
            queue: Arc::new(ConnectionQueue::new(QUEUE_CAPACITY)),
            stop: AtomicBool::new(false),
            tls,
            middleware,
        });

        let pool = {
            let context = Arc::clone(&context);
            ThreadPool::spawn(threads, Arc::clone(&context.queue), move |_id| {
                let context = Arc::clone(&context);
                let size = context.settings.max_request_size;
                let mut buf = vec![0u8; size];
                move |conn: Connection| {
                    // A panic while serving leaves the buffer taken.
                    if buf.len() != size {
                        buf = vec![0u8; size];
                    }
                    buf = connection::serve(&context, conn, mem::take(&mut buf));
                }
            })
        };
        let mut pool = pool?;

        let acceptor = {
            let context = Arc::clone(&context);
            thread::Builder::new()
                .name("embedserve-accept".to_string())
                .spawn(move || {
                    if let Err(e) = listener::accept_loop(&context, &listeners) {
                        tracing::error!(error = %e, "accept loop failed");
                    }
                })
        };
        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(e) => {
                context.stop.store(true, Ordering::Release);
                context.queue.close();
                pool.join();
                return Err(e.into());
            }
        };

        tracing::info!(workers = pool.size(), listeners = ?local_addrs, "server started");
        Ok(Self {
            context,
            local_addrs,
            acceptor: Some(acceptor),
            pool,
        })
    }

    /// Addresses the listeners are bound to, in `listening_ports` order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Whether [`Server::stop`] has been called.
    pub fn is_stopping(&self) -> bool {
        self.context.stopping()
    }

    /// Stop accepting, let workers finish their current request, and wait for
    /// every thread to exit. Calling it again does nothing.
    pub fn stop(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        self.context.stop.store(true, Ordering::Release);
        self.context.queue.close();
        if acceptor.join().is_err() {
            tracing::error!("accept thread panicked");
        }
        self.context.queue.wait_workers();
        self.pool.join();
        tracing::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drop_privileges(user: &str) -> Result<()> {
    use nix::unistd::{User, setgid, setuid};

    let failed = |reason: String| ServerError::Privileges {
        user: user.to_string(),
        reason,
    };
    let account = User::from_name(user)
        .map_err(|e| failed(e.to_string()))?
        .ok_or_else(|| failed("no such user".to_string()))?;
    setgid(account.gid).map_err(|e| failed(format!("setgid: {e}")))?;
    setuid(account.uid).map_err(|e| failed(format!("setuid: {e}")))?;
    tracing::info!(user, "switched user");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn local_config() -> Config {
        let dir = std::env::temp_dir();
        Config::new()
            .with("listening_ports", "127.0.0.1:0")
            .and_then(|c| c.with("document_root", dir.display().to_string()))
            .and_then(|c| c.with("num_threads", "2"))
            .unwrap()
    }

    #[test]
    fn start_and_stop() {
        let mut server = Server::start(local_config()).unwrap();
        assert_eq!(server.local_addrs().len(), 1);
        assert!(!server.is_stopping());

        let mut client = TcpStream::connect(server.local_addrs()[0]).unwrap();
        client.write_all(b"OPTIONS * HTTP/1.0\r\n\r\n").unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 "), "{reply}");

        server.stop();
        assert!(server.is_stopping());
        server.stop();
    }

    #[test]
    fn tls_listener_without_certificate_fails_to_start() {
        let config = local_config().with("listening_ports", "127.0.0.1:0s").unwrap();
        assert!(matches!(Server::start(config), Err(ServerError::Tls(_))));
    }

    #[test]
    fn unknown_user_fails_to_start() {
        let config = local_config()
            .with("run_as_user", "no-such-user-embedserve")
            .unwrap();
        assert!(matches!(Server::start(config), Err(ServerError::Privileges { .. })));
    }
}
