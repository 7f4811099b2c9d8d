//! LDAP backend for dirconn.
//!
//! Implements [`dirconn_core::Connection`] on top of the blocking `ldap3` client, with RFC 2696
//! paged search cursors, an identity-scoped session pool and translation of LDAP result codes
//! into the dirconn error taxonomy.
//!
//! Register the backend with a [`ConnectionRegistry`] through [`register`], or build an
//! [`LdapConnection`] directly.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod connection;
mod controls;
mod cursor;
mod dn;
mod pool;
mod session;
mod translate;

use dirconn_core::config::DEFAULT_CONNECTION_TYPE;
use dirconn_core::{Connection, ConnectionRegistry};

pub use connection::LdapConnection;
pub use controls::{sort_request_control, SORT_REQUEST_OID};
pub use cursor::{PagedResultCursor, SimpleResultCursor};
pub use dn::{same_dn, Ava, Dn, DnError, Rdn};
pub use pool::{PoolKey, PoolSettings, PooledSession, SessionLease, SessionPool};
pub use session::{
    DirectoryModification, LdapSession, PageRequest, RawAttribute, RawEntry,
    RealSessionConnector, SearchPage, SearchRequest, SessionConnector, SessionError,
    RC_NO_SUCH_OBJECT, RC_REFERRAL, RC_SIZE_LIMIT_EXCEEDED, RC_SUCCESS, STARTTLS_PROPERTY,
};
pub use translate::{category_for_code, category_of, translate, translate_bind};

/// Type identifier this backend registers under.
pub const CONNECTION_TYPE: &str = DEFAULT_CONNECTION_TYPE;

/// Registers [`LdapConnection`] under [`CONNECTION_TYPE`].
pub fn register(registry: &mut ConnectionRegistry) {
    registry.register(CONNECTION_TYPE, |config| {
        LdapConnection::new(config).map(|connection| Box::new(connection) as Box<dyn Connection>)
    });
}

/// A registry with this backend registered.
#[must_use]
pub fn default_registry() -> ConnectionRegistry {
    let mut registry = ConnectionRegistry::new();
    register(&mut registry);
    registry
}
