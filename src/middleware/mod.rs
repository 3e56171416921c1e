//! Hooks an embedding application runs ahead of the built-in dispatcher.
//!
//! Middleware sees every request after URI normalisation and authentication
//! and may serve it itself, in which case nothing else runs.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crate::http::{Method, RequestContext};

/// What the dispatcher does after a middleware returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going: the next middleware, then the built-in handlers.
    Continue,
    /// The response has been sent.
    Handled,
}

/// Middleware trait
pub trait Middleware: Send + Sync {
    /// Inspect the request; send a response and return [`Flow::Handled`] to claim it.
    ///
    /// An `Err` means the connection is unusable and will be closed.
    fn before_dispatch(&self, ctx: &mut RequestContext<'_>) -> io::Result<Flow>;
}

impl<F> Middleware for F
where
    F: Fn(&mut RequestContext<'_>) -> io::Result<Flow> + Send + Sync,
{
    fn before_dispatch(&self, ctx: &mut RequestContext<'_>) -> io::Result<Flow> {
        self(ctx)
    }
}

/// Request handler for an exact method and path.
pub type Handler = Arc<dyn Fn(&mut RequestContext<'_>) -> io::Result<()> + Send + Sync>;

/// Exact-match routes served ahead of the filesystem.
#[derive(Default, Clone)]
pub struct Routes {
    routes: HashMap<(Method, String), Handler>,
}

impl Routes {
    /// Empty route table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `method path` with `handler`. The path is matched after normalisation,
    /// without the query string.
    pub fn route<H>(&mut self, method: Method, path: &str, handler: H)
    where
        H: Fn(&mut RequestContext<'_>) -> io::Result<()> + Send + Sync + 'static,
    {
        self.routes.insert((method, path.to_string()), Arc::new(handler));
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Middleware for Routes {
    fn before_dispatch(&self, ctx: &mut RequestContext<'_>) -> io::Result<Flow> {
        let key = (ctx.request.method, ctx.request.uri.clone());
        match self.routes.get(&key) {
            Some(handler) => {
                handler(ctx)?;
                Ok(Flow::Handled)
            }
            None => Ok(Flow::Continue),
        }
    }
}

/// Middleware in registration order.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Number of middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// True when the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run each middleware until one claims the request.
    pub fn run(&self, ctx: &mut RequestContext<'_>) -> io::Result<Flow> {
        for middleware in &self.middlewares {
            if middleware.before_dispatch(ctx)? == Flow::Handled {
                return Ok(Flow::Handled);
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(_: &mut RequestContext<'_>) -> io::Result<Flow> {
        Ok(Flow::Continue)
    }

    fn claim(_: &mut RequestContext<'_>) -> io::Result<Flow> {
        Ok(Flow::Handled)
    }

    #[test]
    fn functions_and_routes_chain_up() {
        let mut routes = Routes::new();
        routes.route(Method::GET, "/status", |_ctx| Ok(()));
        routes.route(Method::POST, "/status", |_ctx| Ok(()));
        assert_eq!(routes.len(), 2);

        let chain = Chain::new()
            .add(pass)
            .add(claim)
            .add(routes);
        assert_eq!(chain.len(), 3);
        assert!(!chain.is_empty());
    }
}
