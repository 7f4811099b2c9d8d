//! LDAP implementation of [`Connection`].

use crate::cursor::{fetch_page, to_entry, GenerationTicket, PagedResultCursor, SimpleResultCursor};
use crate::dn::{same_dn, Dn};
use crate::pool::{open_session, PoolKey, PoolSettings, SessionLease, SessionPool};
use crate::session::{
    DirectoryModification, LdapSession, RawAttribute, RealSessionConnector, SearchPage,
    SearchRequest, SessionConnector, SessionError, RC_NO_SUCH_OBJECT,
};
use crate::translate::{translate, translate_bind};
use dirconn_core::{
    Attribute, AuthenticationMode, Connection, ConnectionConfig, Credentials, Entry, Error,
    ErrorKind, LdapUrl, Result, ResultCursor, SearchControls,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection to an LDAP server.
///
/// Holds at most one session. Sessions for simple binds come from an identity-scoped pool
/// when the configuration enables pooling; anonymous sessions are always opened directly.
pub struct LdapConnection {
    id: Uuid,
    config: Arc<ConnectionConfig>,
    url: LdapUrl,
    connector: Arc<dyn SessionConnector>,
    pool: Option<Arc<SessionPool>>,
    lease: Option<SessionLease>,
    credentials: Option<Credentials>,
    generation: Arc<AtomicU64>,
}

impl LdapConnection {
    /// Creates an unbound connection that talks to the configured server through `ldap3`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] if the URL is invalid.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let config = Arc::new(config);
        let connector: Arc<dyn SessionConnector> =
            Arc::new(RealSessionConnector::new(config.clone()));
        Self::build(config, connector, None)
    }

    /// Creates an unbound connection opening its sessions through `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] if the URL is invalid.
    pub fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self> {
        Self::build(Arc::new(config), connector, None)
    }

    /// Creates an unbound connection sharing `pool` with other connections.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] if the URL is invalid.
    pub fn with_pool(config: ConnectionConfig, pool: Arc<SessionPool>) -> Result<Self> {
        let connector = pool.connector().clone();
        Self::build(Arc::new(config), connector, Some(pool))
    }

    fn build(
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn SessionConnector>,
        pool: Option<Arc<SessionPool>>,
    ) -> Result<Self> {
        let url = config.ldap_url()?;
        let pool = pool.or_else(|| {
            config.pool_enabled().then(|| {
                Arc::new(SessionPool::new(
                    PoolSettings::from_config(&config),
                    connector.clone(),
                ))
            })
        });
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            url,
            connector,
            pool,
            lease: None,
            credentials: None,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Identifier recorded in this connection's log events.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration this connection was created from.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn open_lease(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<SessionLease, SessionError> {
        match (&self.pool, credentials) {
            (Some(pool), Credentials::Simple { .. }) => {
                let key = PoolKey::new(self.url.server_url(), credentials);
                pool.checkout(&key, credentials).map(SessionLease::Pooled)
            }
            _ => open_session(self.connector.as_ref(), credentials).map(SessionLease::Owned),
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs `operation` on the bound session, handing back the untranslated outcome.
    fn attempt<T>(
        &mut self,
        operation: impl FnOnce(&mut dyn LdapSession) -> std::result::Result<T, SessionError>,
    ) -> Result<std::result::Result<T, SessionError>> {
        let lease = self.lease.as_mut().ok_or_else(closed)?;
        Ok(operation(lease.session()))
    }

    fn run<T>(
        &mut self,
        action: &'static str,
        operation: impl FnOnce(&mut dyn LdapSession) -> std::result::Result<T, SessionError>,
    ) -> Result<T> {
        self.attempt(operation)?
            .map_err(|err| self.failed(action, translate(err)))
    }

    /// Records a translated failure. A session that lost its transport is not reused.
    fn failed(&mut self, action: &'static str, err: Error) -> Error {
        if err.kind() == ErrorKind::CommunicationFailure {
            if let Some(lease) = self.lease.as_mut() {
                lease.mark_broken();
            }
        }
        self.report(action, err)
    }

    fn report(&self, action: &'static str, err: Error) -> Error {
        if err.should_log() {
            error!(
                connection_id = %self.id,
                action,
                kind = err.error_code(),
                error = %err,
                "directory operation failed"
            );
        } else {
            debug!(
                connection_id = %self.id,
                action,
                kind = err.error_code(),
                error = %err,
                "directory operation failed"
            );
        }
        err
    }

    fn search_page(&mut self, request: &SearchRequest) -> Result<SearchPage> {
        let lease = self.lease.as_mut().ok_or_else(closed)?;
        fetch_page(lease.session(), request).map_err(|err| self.failed("search", err))
    }

    /// Resolves a delete that hit a missing object: fine when only the leaf is absent.
    fn delete_missing(&mut self, dn: &str, matched: String, text: String) -> Result<()> {
        let target = Dn::parse(dn)?;
        let Some(parent) = target.parent().filter(|parent| !parent.is_root()) else {
            debug!(connection_id = %self.id, dn, "entry to delete does not exist");
            return Ok(());
        };
        let parent = parent.to_string();

        let parent_exists = if matched.is_empty() {
            self.exists(&parent)?
        } else {
            same_dn(&matched, &parent)
        };
        if parent_exists {
            debug!(connection_id = %self.id, dn, "entry to delete does not exist");
            return Ok(());
        }
        Err(self.failed(
            "delete entry",
            translate(SessionError::result(RC_NO_SUCH_OBJECT, matched, text)),
        ))
    }
}

impl Connection for LdapConnection {
    fn bind(&mut self, credentials: Credentials) -> Result<()> {
        let credentials = if self.config.authentication == AuthenticationMode::None {
            Credentials::Anonymous
        } else {
            credentials
        };

        if !self.is_closed() {
            info!(connection_id = %self.id, "connection is bound, closing it before binding again");
            if let Err(err) = self.close() {
                warn!(connection_id = %self.id, error = %err, "failed to close previous session");
            }
        }

        let principal = credentials.dn().unwrap_or("anonymous").to_string();
        info!(connection_id = %self.id, url = %self.url, principal = %principal, "binding");

        match self.open_lease(&credentials) {
            Ok(lease) => {
                self.lease = Some(lease);
                self.credentials = Some(credentials);
                self.bump_generation();
                info!(connection_id = %self.id, principal = %principal, "bound");
                Ok(())
            }
            Err(err) => {
                let err = translate_bind(err);
                error!(
                    connection_id = %self.id,
                    url = %self.url,
                    principal = %principal,
                    kind = err.error_code(),
                    failure = ?err.bind_failure(),
                    error = %err,
                    "bind failed"
                );
                Err(err)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    fn bound_user_dn(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .and_then(Credentials::dn)
            .map(ToString::to_string)
    }

    fn close(&mut self) -> Result<()> {
        self.credentials = None;
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        self.bump_generation();
        info!(connection_id = %self.id, "closing connection");
        lease.release().map_err(|err| {
            let err = translate(err);
            warn!(connection_id = %self.id, error = %err, "failed to close connection");
            err
        })
    }

    fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
        controls: &SearchControls,
    ) -> Result<Box<dyn ResultCursor>> {
        let controls = controls.normalized();
        let request = SearchRequest::new(base_dn, filter, &controls, self.config.referral);
        debug!(
            connection_id = %self.id,
            base = base_dn,
            filter,
            scope = %controls.scope(),
            page_size = controls.page_size(),
            "searching"
        );

        if !controls.is_paging_enabled() {
            let page = self.search_page(&request)?;
            let ticket = GenerationTicket::issue(&self.generation);
            return Ok(Box::new(SimpleResultCursor::new(page, base_dn, ticket)));
        }

        // Paging keeps server-side state, so it runs on a session of its own.
        let credentials = match (&self.lease, &self.credentials) {
            (Some(_), Some(credentials)) => credentials.clone(),
            _ => return Err(closed()),
        };
        let lease = self
            .open_lease(&credentials)
            .map_err(|err| self.report("paged search", translate(err)))?;
        let ticket = GenerationTicket::issue(&self.generation);
        let cursor = PagedResultCursor::start(lease, request, ticket)
            .map_err(|err| self.report("paged search", err))?;
        Ok(Box::new(cursor))
    }

    fn lookup(&mut self, dn: &str, attributes: Option<&[String]>) -> Result<Entry> {
        let request = SearchRequest::base_object(dn, attributes, self.config.referral);
        let page = self.search_page(&request)?;
        page.entries
            .into_iter()
            .next()
            .map(|raw| to_entry(raw, dn))
            .ok_or_else(|| Error::new(ErrorKind::NameNotFound, format!("entry `{dn}` not found")))
    }

    fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        let attributes = entry
            .attributes()
            .filter(|attribute| !attribute.is_empty())
            .map(|attribute| (attribute.name().to_string(), raw_values(attribute)))
            .collect::<Vec<RawAttribute>>();
        debug!(connection_id = %self.id, dn = %entry.dn(), "adding entry");
        self.run("add entry", |session| session.add(entry.dn(), &attributes))?;
        info!(connection_id = %self.id, dn = %entry.dn(), "entry added");
        Ok(())
    }

    fn update_entry(&mut self, entry: &Entry) -> Result<()> {
        let modifications = entry
            .attributes()
            .map(|attribute| DirectoryModification::Replace {
                attribute: attribute.name().to_string(),
                values: raw_values(attribute),
            })
            .collect::<Vec<_>>();
        if modifications.is_empty() {
            debug!(connection_id = %self.id, dn = %entry.dn(), "entry has no attributes to update");
            return Ok(());
        }
        debug!(connection_id = %self.id, dn = %entry.dn(), "updating entry");
        self.run("update entry", |session| {
            session.modify(entry.dn(), &modifications)
        })?;
        info!(connection_id = %self.id, dn = %entry.dn(), "entry updated");
        Ok(())
    }

    fn delete_entry(&mut self, dn: &str) -> Result<()> {
        debug!(connection_id = %self.id, dn, "deleting entry");
        match self.attempt(|session| session.delete(dn))? {
            Ok(()) => {
                info!(connection_id = %self.id, dn, "entry deleted");
                Ok(())
            }
            Err(SessionError::Result {
                code: RC_NO_SUCH_OBJECT,
                matched,
                text,
            }) => self.delete_missing(dn, matched, text),
            Err(err) => Err(self.failed("delete entry", translate(err))),
        }
    }

    fn rename_entry(&mut self, old_dn: &str, new_dn: &str) -> Result<()> {
        let old = Dn::parse(old_dn)?;
        let new = Dn::parse(new_dn)?;
        let new_rdn = match (old.is_root(), new.rdn()) {
            (false, Some(rdn)) => rdn.to_string(),
            _ => {
                return Err(Error::invalid_input(format!(
                    "cannot rename `{old_dn}` to `{new_dn}`"
                )))
            }
        };
        let new_superior = match (old.parent(), new.parent()) {
            (Some(old_parent), Some(new_parent)) if old_parent == new_parent => None,
            (_, new_parent) => new_parent.map(|parent| parent.to_string()),
        };

        debug!(connection_id = %self.id, old_dn, new_dn, "renaming entry");
        self.run("rename entry", |session| {
            session.rename(old_dn, &new_rdn, new_superior)
        })?;
        info!(connection_id = %self.id, old_dn, new_dn, "entry renamed");
        Ok(())
    }

    fn add_attribute(&mut self, dn: &str, attribute: &Attribute) -> Result<()> {
        if attribute.is_empty() {
            return Err(Error::invalid_input(format!(
                "attribute `{}` has no values to add",
                attribute.name()
            )));
        }
        let modification = DirectoryModification::Add {
            attribute: attribute.name().to_string(),
            values: raw_values(attribute),
        };
        debug!(
            connection_id = %self.id,
            dn,
            attribute = %attribute.name(),
            "adding attribute values"
        );
        self.run("add attribute", |session| session.modify(dn, &[modification]))
    }

    fn update_attribute(&mut self, dn: &str, attribute: &Attribute) -> Result<()> {
        let modification = DirectoryModification::Replace {
            attribute: attribute.name().to_string(),
            values: raw_values(attribute),
        };
        debug!(connection_id = %self.id, dn, attribute = %attribute.name(), "replacing attribute");
        self.run("update attribute", |session| {
            session.modify(dn, &[modification])
        })
    }

    fn delete_attribute(&mut self, dn: &str, attribute: &Attribute) -> Result<()> {
        let modification = DirectoryModification::Delete {
            attribute: attribute.name().to_string(),
            values: raw_values(attribute),
        };
        debug!(
            connection_id = %self.id,
            dn,
            attribute = %attribute.name(),
            "deleting attribute values"
        );
        self.run("delete attribute", |session| {
            session.modify(dn, &[modification])
        })
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(connection_id = %self.id, error = %err, "close on drop failed");
        }
    }
}

fn raw_values(attribute: &Attribute) -> Vec<Vec<u8>> {
    attribute
        .values()
        .iter()
        .map(|value| value.as_bytes().to_vec())
        .collect()
}

fn closed() -> Error {
    Error::new(ErrorKind::CommunicationFailure, "connection is closed")
}
