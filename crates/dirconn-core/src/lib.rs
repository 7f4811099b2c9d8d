//! # dirconn-core
//!
//! Backend-independent building blocks for directory-service clients.
//!
//! ## Modules
//!
//! - [`entry`] - Entries, single- and multi-valued attributes, and the map projection
//! - [`ldif`] - LDIF rendering of entries
//! - [`controls`] - Search scope, limits, paging and ordering
//! - [`config`] - Connection configuration and directory URLs
//! - [`error`] - Error taxonomy and translation of native failures
//! - [`connection`] - The `Connection` and `ResultCursor` contracts
//! - [`factory`] - Registry selecting a connection implementation by type

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod controls;
pub mod entry;
pub mod error;
pub mod factory;
pub mod ldif;

pub use config::{AuthenticationMode, ConnectionConfig, LdapUrl, Referral};
pub use connection::{Connection, Credentials, Entries, ResultCursor, ANONYMOUS_PRINCIPAL};
pub use controls::{SearchControls, SearchControlsBuilder, SearchScope, SortKey};
pub use entry::{Attribute, AttributeValue, Entry, EntryMap, MapValue, MAP_DN_KEY};
pub use error::{BindFailure, Error, ErrorKind, NativeCategory, NativeFailure, Result};
pub use factory::{ConnectionConstructor, ConnectionRegistry};
