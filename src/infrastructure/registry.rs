//! URI-scheme dispatch for link construction.
//!
//! Handlers are registered on a [`SchemeRegistry`] during start-up. Building
//! it consumes the registry and yields an immutable [`LinkFactory`], so the
//! table can no longer change once links are being made.

use crate::error::LinkError;
use crate::infrastructure::link::Link;
use crate::infrastructure::tcp::Connection;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// Constructs links of one URI scheme.
#[async_trait]
pub trait SchemeHandler: Send + Sync {
    /// Connects to `uri` and wraps the connection in a new, not yet started link.
    async fn connect(&self, uri: &Url) -> Result<Link, LinkError>;

    /// Wraps an accepted inbound connection in a new, not yet started link.
    fn accept(&self, connection: Connection) -> Link;
}

#[derive(Default)]
pub struct SchemeRegistry {
    handlers: HashMap<String, Arc<dyn SchemeHandler>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `scheme`, replacing any earlier registration.
    pub fn register(mut self, scheme: &str, handler: Arc<dyn SchemeHandler>) -> Self {
        if self
            .handlers
            .insert(scheme.to_ascii_lowercase(), handler)
            .is_some()
        {
            warn!(scheme, "scheme handler registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> LinkFactory {
        LinkFactory {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[derive(Clone)]
pub struct LinkFactory {
    handlers: Arc<HashMap<String, Arc<dyn SchemeHandler>>>,
}

impl LinkFactory {
    /// Builds a link for `uri` through the handler of its scheme.
    pub async fn make(&self, uri: &str) -> Result<Link, LinkError> {
        let parsed = Url::parse(uri)
            .map_err(|e| LinkError::ConstructionFailed(format!("invalid URI {uri:?}: {e}")))?;
        let handler = self.handler(parsed.scheme()).ok_or_else(|| {
            LinkError::ConstructionFailed(format!("no handler for scheme {:?}", parsed.scheme()))
        })?;

        handler.connect(&parsed).await.map_err(|e| match e {
            LinkError::ConstructionFailed(_) => e,
            other => LinkError::ConstructionFailed(format!("{uri}: {other}")),
        })
    }

    pub fn handler(&self, scheme: &str) -> Option<Arc<dyn SchemeHandler>> {
        self.handlers.get(&scheme.to_ascii_lowercase()).cloned()
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
