//! Connection management and typed fetches against the legacy transactional source.

mod client;
mod error;
mod legacy;
#[cfg(feature = "odbc")]
mod odbc;
mod query;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;

pub use client::{SourceClient, SourceConfig, SourceConnection, SourceConnector, SourceRow};
pub use error::SourceError;
pub use legacy::{LegacySource, SourceSystem};
#[cfg(feature = "odbc")]
pub use odbc::OdbcConnector;
pub use query::{Filter, SelectQuery};

pub const CRATE_NAME: &str = "stockwise-source";

/// Logical source database a connection resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceEndpoint {
    /// The production database; incremental sync reads here.
    Live,
    /// A full-history snapshot used for destructive reloads.
    Full,
}

impl fmt::Display for SourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceEndpoint::Live => f.write_str("live"),
            SourceEndpoint::Full => f.write_str("full"),
        }
    }
}

/// Anything whose subsequent source access can be redirected to another endpoint.
pub trait EndpointSwitch {
    /// Redirects to `endpoint` and returns the endpoint that was active before.
    fn switch_endpoint(&mut self, endpoint: SourceEndpoint) -> SourceEndpoint;
}

/// Restores the previous endpoint when dropped, including on early return via `?`.
pub struct EndpointScope<'a, T: EndpointSwitch + ?Sized> {
    target: &'a mut T,
    previous: SourceEndpoint,
}

pub fn scoped_endpoint<T: EndpointSwitch + ?Sized>(
    target: &mut T,
    endpoint: SourceEndpoint,
) -> EndpointScope<'_, T> {
    let previous = target.switch_endpoint(endpoint);
    EndpointScope { target, previous }
}

impl<T: EndpointSwitch + ?Sized> EndpointScope<'_, T> {
    pub fn previous(&self) -> SourceEndpoint {
        self.previous
    }
}

impl<T: EndpointSwitch + ?Sized> Deref for EndpointScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.target
    }
}

impl<T: EndpointSwitch + ?Sized> DerefMut for EndpointScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.target
    }
}

impl<T: EndpointSwitch + ?Sized> Drop for EndpointScope<'_, T> {
    fn drop(&mut self) {
        self.target.switch_endpoint(self.previous);
    }
}

/// Connector used when the binary is built without a source driver.
#[derive(Debug, Default)]
pub struct DisabledConnector;

#[async_trait]
impl SourceConnector for DisabledConnector {
    async fn connect(
        &self,
        _connection_string: &str,
    ) -> Result<Box<dyn SourceConnection>, SourceError> {
        Err(SourceError::Unsupported(
            "no source driver compiled in; rebuild with `--features odbc`".to_string(),
        ))
    }
}

/// Driver-backed connector when available, otherwise [`DisabledConnector`].
pub fn default_connector() -> Arc<dyn SourceConnector> {
    #[cfg(feature = "odbc")]
    {
        Arc::new(OdbcConnector::default())
    }
    #[cfg(not(feature = "odbc"))]
    {
        Arc::new(DisabledConnector)
    }
}
