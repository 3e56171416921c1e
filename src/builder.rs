//! Server builder with middleware support

use std::io;

use crate::{Chain, Config, Flow, Method, Middleware, RequestContext, Result, Routes, Server};

/// Server builder
///
/// Collects options, middleware and exact-match routes, then starts a
/// [`Server`]. Routes run after every middleware and ahead of the
/// filesystem.
///
/// ```no_run
/// use embedserve::{Method, Response, ServerBuilder};
///
/// let server = ServerBuilder::new()
///     .option("listening_ports", "127.0.0.1:8080")?
///     .route(Method::GET, "/health", |ctx| ctx.send_response(&Response::ok().body("ok")))
///     .start()?;
/// # drop(server);
/// # Ok::<(), embedserve::ServerError>(())
/// ```
pub struct ServerBuilder {
    config: Config,
    chain: Chain,
    routes: Routes,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Builder holding every option at its default.
    pub fn new() -> Self {
        Self::from_config(Config::new())
    }

    /// Builder starting from an existing option table.
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            chain: Chain::new(),
            routes: Routes::new(),
        }
    }

    /// Set an option; unknown names are rejected here rather than at start.
    pub fn option(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.config.set(name, value)?;
        Ok(self)
    }

    /// Add middleware
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.chain = self.chain.add(middleware);
        self
    }

    /// Add a closure as middleware.
    pub fn hook<F>(self, hook: F) -> Self
    where
        F: Fn(&mut RequestContext<'_>) -> io::Result<Flow> + Send + Sync + 'static,
    {
        self.middleware(hook)
    }

    /// Add route handler
    pub fn route<H>(mut self, method: Method, path: &str, handler: H) -> Self
    where
        H: Fn(&mut RequestContext<'_>) -> io::Result<()> + Send + Sync + 'static,
    {
        self.routes.route(method, path, handler);
        self
    }

    /// Start the server.
    pub fn start(self) -> Result<Server> {
        let chain = if self.routes.is_empty() {
            self.chain
        } else {
            self.chain.add(self.routes)
        };
        Server::start_with(self.config, chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerError;

    #[test]
    fn unknown_option_is_rejected_early() {
        let err = ServerBuilder::new().option("no_such_option", "1").err();
        assert!(matches!(err, Some(ServerError::UnknownOption(name)) if name == "no_such_option"));
    }

    #[test]
    fn hooks_and_routes_are_collected() {
        let builder = ServerBuilder::new()
            .hook(|_ctx| Ok(Flow::Continue))
            .route(Method::GET, "/a", |_ctx| Ok(()))
            .route(Method::GET, "/b", |_ctx| Ok(()));
        assert_eq!(builder.chain.len(), 1);
        assert_eq!(builder.routes.len(), 2);
    }
}
