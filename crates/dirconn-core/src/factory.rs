//! Registry of connection implementations.
//!
//! Backends register a constructor under a type identifier; hosts then ask the registry for a
//! connection by handing it a configuration. The registry is an ordinary value, so tests can
//! build one with fakes registered.

use crate::config::{keys, AuthenticationMode, ConnectionConfig};
use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Constructor registered for a connection type.
pub type ConnectionConstructor =
    Arc<dyn Fn(ConnectionConfig) -> Result<Box<dyn Connection>> + Send + Sync>;

/// Maps connection type identifiers to constructors.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    constructors: HashMap<String, ConnectionConstructor>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `connection_type`, replacing any previous registration.
    pub fn register<F>(&mut self, connection_type: impl Into<String>, constructor: F)
    where
        F: Fn(ConnectionConfig) -> Result<Box<dyn Connection>> + Send + Sync + 'static,
    {
        let connection_type = connection_type.into();
        debug!(connection_type = %connection_type, "registering connection type");
        self.constructors
            .insert(connection_type, Arc::new(constructor));
    }

    /// Returns true if a constructor is registered for `connection_type`.
    #[must_use]
    pub fn is_registered(&self, connection_type: &str) -> bool {
        self.constructors.contains_key(connection_type)
    }

    /// Registered type identifiers, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Creates a connection from the string-keyed property form.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Configuration`] when the `type` property is missing, unregistered or the
    /// remaining properties are invalid; [`ErrorKind::Unknown`] when the constructor itself
    /// fails for any other reason.
    pub fn create(&self, properties: &HashMap<String, String>) -> Result<Box<dyn Connection>> {
        let connection_type = properties
            .get(keys::TYPE)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "connection property `{}` is required",
                    keys::TYPE
                ))
            })?;
        self.ensure_registered(connection_type)?;
        let config = ConnectionConfig::from_properties(properties)?;
        self.create_from_config(config)
    }

    /// Creates a connection from named arguments. `extended` supplies provider properties that
    /// the named arguments override.
    ///
    /// # Errors
    ///
    /// See [`ConnectionRegistry::create`].
    pub fn connect(
        &self,
        connection_type: &str,
        url: &str,
        authentication: AuthenticationMode,
        extended: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>> {
        let mut properties = extended.clone();
        properties.insert(keys::TYPE.to_string(), connection_type.to_string());
        properties.insert(keys::URL.to_string(), url.to_string());
        properties.insert(
            keys::AUTHENTICATION.to_string(),
            authentication.as_str().to_string(),
        );
        self.create(&properties)
    }

    /// Creates a connection from a parsed configuration.
    ///
    /// # Errors
    ///
    /// See [`ConnectionRegistry::create`].
    pub fn create_from_config(&self, config: ConnectionConfig) -> Result<Box<dyn Connection>> {
        let constructor = self.ensure_registered(&config.connection_type)?.clone();
        let connection_type = config.connection_type.clone();

        match catch_unwind(AssertUnwindSafe(|| constructor(config))) {
            Ok(Ok(connection)) => {
                debug!(connection_type = %connection_type, "connection created");
                Ok(connection)
            }
            Ok(Err(err))
                if matches!(err.kind(), ErrorKind::Configuration | ErrorKind::InvalidInput) =>
            {
                Err(err)
            }
            Ok(Err(err)) => {
                error!(
                    connection_type = %connection_type,
                    error = %err,
                    "connection construction failed"
                );
                Err(Error::with_cause(
                    ErrorKind::Unknown,
                    format!("cannot instantiate connection of type `{connection_type}`"),
                    err,
                ))
            }
            Err(_) => {
                error!(connection_type = %connection_type, "connection constructor panicked");
                Err(Error::new(
                    ErrorKind::Unknown,
                    format!("constructor for connection type `{connection_type}` panicked"),
                ))
            }
        }
    }

    fn ensure_registered(&self, connection_type: &str) -> Result<&ConnectionConstructor> {
        self.constructors.get(connection_type).ok_or_else(|| {
            Error::configuration(format!(
                "unsupported connection type `{connection_type}`"
            ))
        })
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("types", &self.types())
            .finish()
    }
}
