//! Lazily established, idempotently closed broker connection.
//!
//! Each facade holds one [`ConnectionManager`]. The connection is created and
//! started on the first `connect`, reused by every later one, and closed at
//! most once. A connection handed in by the caller (see
//! [`ConnectionManager::bind_shared`]) is used but never closed here.

use crate::error::MqError;
use crate::release::ReleaseReport;
use crate::transport::{BrokerUrl, Connection, ConnectionFactory, TransportRegistry};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Owns (or borrows) the single broker connection of a facade
pub struct ConnectionManager {
    url: String,
    factory: Arc<dyn ConnectionFactory>,
    connection: Option<Arc<dyn Connection>>,
    owned: bool,
}

impl ConnectionManager {
    /// Manager for `url` using the default transports
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_factory(url, Arc::new(TransportRegistry::default()))
    }

    /// Manager for `url` using a specific connection factory
    pub fn with_factory(url: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            url: url.into(),
            factory,
            connection: None,
            owned: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The current connection, if one is held and still open
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// True when the held connection was created (and will be closed) here
    pub fn is_owned(&self) -> bool {
        self.connection.is_some() && self.owned
    }

    /// True when `connection` is the one currently held
    pub fn is_bound_to(&self, connection: &Arc<dyn Connection>) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|held| held.connection_id() == connection.connection_id())
    }

    /// Return the open connection, creating and starting one if needed.
    ///
    /// Calling this repeatedly never creates a second connection while the
    /// first is open.
    pub async fn ensure_connection(&mut self) -> Result<Arc<dyn Connection>, MqError> {
        if let Some(connection) = self.connection() {
            return Ok(connection);
        }

        if let Some(stale) = self.connection.take() {
            if !self.owned {
                return Err(MqError::transport(
                    &self.url,
                    format!(
                        "shared connection {} was closed by its owner",
                        stale.connection_id()
                    ),
                ));
            }
            debug!(connection_id = stale.connection_id(), "Replacing closed connection");
        }

        let url = BrokerUrl::parse(&self.url)?;
        let connection = self.factory.create_connection(&url).await?;

        if let Err(e) = connection.start().await {
            if let Err(close_error) = connection.close() {
                debug!(error = %close_error, "Failed to close connection that did not start");
            }
            return Err(e);
        }

        info!(
            url = %self.url,
            connection_id = connection.connection_id(),
            "Connected to broker"
        );
        self.connection = Some(connection.clone());
        self.owned = true;
        Ok(connection)
    }

    /// Use a connection owned by someone else. It is started if needed and
    /// will not be closed by [`ConnectionManager::close`].
    ///
    /// The caller releases anything created from a previously held
    /// connection before binding a different one.
    pub async fn bind_shared(&mut self, connection: Arc<dyn Connection>) -> Result<(), MqError> {
        if self.is_bound_to(&connection) && !connection.is_closed() {
            return Ok(());
        }

        if connection.is_closed() {
            return Err(MqError::transport(
                &self.url,
                format!("shared connection {} is closed", connection.connection_id()),
            ));
        }

        if !connection.is_started() {
            connection.start().await?;
        }

        let previous = self.close();
        if !previous.is_empty() {
            debug!(%previous, "Released previous connection before binding a shared one");
        }

        debug!(
            connection_id = connection.connection_id(),
            "Bound to shared connection"
        );
        self.connection = Some(connection);
        self.owned = false;
        Ok(())
    }

    /// Close the connection if this manager owns it. Idempotent and never
    /// fails; a failure is recorded in the returned report.
    pub fn close(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::new();
        let Some(connection) = self.connection.take() else {
            return report;
        };

        if !self.owned {
            debug!(
                connection_id = connection.connection_id(),
                "Leaving shared connection open"
            );
            return report;
        }

        let resource = format!("connection {}", connection.connection_id());
        report.record(resource, connection.close());
        self.owned = false;
        report
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url)
            .field(
                "connection_id",
                &self.connection.as_ref().map(|c| c.connection_id().to_string()),
            )
            .field("owned", &self.owned)
            .finish()
    }
}
