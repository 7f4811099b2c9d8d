//! Protocol sessions.
//!
//! [`LdapSession`] is the narrow seam between connection logic and the wire: one blocking call
//! per LDAP operation, results returned raw with their result codes intact. The production
//! implementation drives [`ldap3::LdapConn`]; tests plug in mocks or an in-memory directory.

use crate::controls::sort_request_control;
use dirconn_core::{ConnectionConfig, LdapUrl, Referral, SearchControls, SearchScope, SortKey};
use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::result::SearchResult;
use ldap3::{
    LdapConn, LdapConnSettings, LdapError, Mod, ResultEntry, Scope, SearchEntry, SearchOptions,
};
use native_tls::{Certificate, TlsConnector};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// LDAP result code for success.
pub const RC_SUCCESS: u32 = 0;
/// LDAP result code returned when the server stopped at its size limit.
pub const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
/// LDAP result code for a referral.
pub const RC_REFERRAL: u32 = 10;
/// LDAP result code for a missing object.
pub const RC_NO_SUCH_OBJECT: u32 = 32;

/// Failure reported by a session, before translation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server answered with a non-success result code.
    #[error("LDAP result code {code}: {text}")]
    Result {
        /// LDAP result code.
        code: u32,
        /// Matched DN reported by the server (closest existing ancestor).
        matched: String,
        /// Diagnostic message.
        text: String,
    },
    /// The server host name does not resolve.
    #[error("unknown host `{host}`")]
    UnknownHost {
        /// Host that failed to resolve.
        host: String,
        /// Resolver failure.
        #[source]
        source: std::io::Error,
    },
    /// Connection establishment or I/O failed.
    #[error("transport failure: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// The operation did not complete within the read timeout.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
    },
    /// Malformed request or response, e.g. an unparsable filter.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Shorthand for a result-code failure.
    #[must_use]
    pub fn result(code: u32, matched: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Result {
            code,
            matched: matched.into(),
            text: text.into(),
        }
    }

    /// Shorthand for a transport failure without a cause.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// LDAP result code, when the failure carries one.
    #[must_use]
    pub const fn code(&self) -> Option<u32> {
        match self {
            Self::Result { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// RFC 2696 paging state of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Entries per page; zero abandons the paged search.
    pub size: u32,
    /// Cookie from the previous response, empty for the first page.
    pub cookie: Vec<u8>,
}

/// A search as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base.
    pub base: String,
    /// RFC 2254 filter, passed verbatim.
    pub filter: String,
    /// Scope.
    pub scope: SearchScope,
    /// Attributes to return; empty returns every user attribute.
    pub attributes: Vec<String>,
    /// Server size limit; zero is unbounded.
    pub size_limit: u32,
    /// Server time limit; zero is unbounded.
    pub time_limit: Duration,
    /// Referral policy.
    pub referral: Referral,
    /// Paging state, `None` for a plain search.
    pub page: Option<PageRequest>,
    /// Requested ordering.
    pub sort: Option<SortKey>,
}

impl SearchRequest {
    /// Builds a request from normalized controls. Paging starts with an empty cookie.
    #[must_use]
    pub fn new(base: &str, filter: &str, controls: &SearchControls, referral: Referral) -> Self {
        Self {
            base: base.to_string(),
            filter: filter.to_string(),
            scope: controls.scope(),
            attributes: controls.attributes().map(<[String]>::to_vec).unwrap_or_default(),
            size_limit: controls.max_results(),
            time_limit: controls.time_limit(),
            referral,
            page: controls.is_paging_enabled().then(|| PageRequest {
                size: controls.page_size(),
                cookie: Vec::new(),
            }),
            sort: controls.sort_key().cloned(),
        }
    }

    /// Point read of one entry.
    #[must_use]
    pub fn base_object(dn: &str, attributes: Option<&[String]>, referral: Referral) -> Self {
        Self {
            base: dn.to_string(),
            filter: "(objectClass=*)".to_string(),
            scope: SearchScope::Object,
            attributes: attributes.map(<[String]>::to_vec).unwrap_or_default(),
            size_limit: 0,
            time_limit: Duration::ZERO,
            referral,
            page: None,
            sort: None,
        }
    }

    /// Copy of this request continuing from `cookie`.
    #[must_use]
    pub fn with_cookie(&self, cookie: Vec<u8>) -> Self {
        let size = self.page.as_ref().map_or(0, |page| page.size);
        Self {
            page: Some(PageRequest { size, cookie }),
            ..self.clone()
        }
    }
}

/// Entry as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    /// DN, relative to the search base when `relative` is set.
    pub dn: String,
    /// Whether `dn` is relative to the search base.
    pub relative: bool,
    /// Text-valued attributes.
    pub attrs: HashMap<String, Vec<String>>,
    /// Attributes holding values that are not valid UTF-8.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

/// One response to a search request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Entries in server order.
    pub entries: Vec<RawEntry>,
    /// Paging cookie; `None` or empty when no more pages exist.
    pub cookie: Option<Vec<u8>>,
    /// Set when the server stopped at a size limit.
    pub truncated: bool,
    /// Referral URLs returned instead of, or alongside, entries.
    pub referrals: Vec<String>,
}

/// Attribute and raw values, as sent in an add request.
pub type RawAttribute = (String, Vec<Vec<u8>>);

/// Modification of a single attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryModification {
    /// Add attribute values.
    Add {
        /// Attribute to modify.
        attribute: String,
        /// Values to add.
        values: Vec<Vec<u8>>,
    },
    /// Delete attribute values.
    Delete {
        /// Attribute to modify.
        attribute: String,
        /// Values to delete (empty removes attribute).
        values: Vec<Vec<u8>>,
    },
    /// Replace attribute values.
    Replace {
        /// Attribute to modify.
        attribute: String,
        /// Replacement values (empty removes attribute).
        values: Vec<Vec<u8>>,
    },
}

/// One bound or unbound protocol session.
#[cfg_attr(test, mockall::automock)]
pub trait LdapSession: Send {
    /// Simple bind.
    ///
    /// # Errors
    ///
    /// Returns the server's result code on rejection.
    fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), SessionError>;

    /// Runs one search round trip (one page when paging).
    ///
    /// # Errors
    ///
    /// Returns the server's result code on failure.
    fn search(&mut self, request: &SearchRequest) -> Result<SearchPage, SessionError>;

    /// Adds an entry.
    ///
    /// # Errors
    ///
    /// Returns the server's result code on failure.
    fn add(&mut self, dn: &str, attributes: &[RawAttribute]) -> Result<(), SessionError>;

    /// Modifies an entry.
    ///
    /// # Errors
    ///
    /// Returns the server's result code on failure.
    fn modify(
        &mut self,
        dn: &str,
        modifications: &[DirectoryModification],
    ) -> Result<(), SessionError>;

    /// Deletes an entry.
    ///
    /// # Errors
    ///
    /// Returns the server's result code on failure.
    fn delete(&mut self, dn: &str) -> Result<(), SessionError>;

    /// Renames and optionally moves an entry; the old RDN is removed.
    ///
    /// # Errors
    ///
    /// Returns the server's result code on failure.
    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<String>,
    ) -> Result<(), SessionError>;

    /// Ends the session.
    ///
    /// # Errors
    ///
    /// Returns the transport failure, if any.
    fn unbind(&mut self) -> Result<(), SessionError>;
}

/// Opens new sessions against the configured server.
#[cfg_attr(test, mockall::automock)]
pub trait SessionConnector: Send + Sync {
    /// Connects a fresh, unbound session.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownHost`] if the host does not resolve, otherwise a transport failure.
    fn connect(&self) -> Result<Box<dyn LdapSession>, SessionError>;
}

/// Session stand-in left behind once a session has been handed back or torn down.
pub(crate) struct DetachedSession;

impl DetachedSession {
    fn detached() -> SessionError {
        SessionError::transport("session is no longer attached")
    }
}

impl LdapSession for DetachedSession {
    fn simple_bind(&mut self, _dn: &str, _password: &str) -> Result<(), SessionError> {
        Err(Self::detached())
    }

    fn search(&mut self, _request: &SearchRequest) -> Result<SearchPage, SessionError> {
        Err(Self::detached())
    }

    fn add(&mut self, _dn: &str, _attributes: &[RawAttribute]) -> Result<(), SessionError> {
        Err(Self::detached())
    }

    fn modify(
        &mut self,
        _dn: &str,
        _modifications: &[DirectoryModification],
    ) -> Result<(), SessionError> {
        Err(Self::detached())
    }

    fn delete(&mut self, _dn: &str) -> Result<(), SessionError> {
        Err(Self::detached())
    }

    fn rename(
        &mut self,
        _dn: &str,
        _new_rdn: &str,
        _new_superior: Option<String>,
    ) -> Result<(), SessionError> {
        Err(Self::detached())
    }

    fn unbind(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Connector backed by `ldap3`.
pub struct RealSessionConnector {
    config: Arc<ConnectionConfig>,
}

impl RealSessionConnector {
    /// Creates a connector for `config`.
    #[must_use]
    pub fn new(config: Arc<ConnectionConfig>) -> Self {
        Self { config }
    }
}

impl SessionConnector for RealSessionConnector {
    fn connect(&self) -> Result<Box<dyn LdapSession>, SessionError> {
        let url = LdapUrl::parse(&self.config.url)
            .map_err(|err| SessionError::Protocol(err.to_string()))?;

        // Resolve first so that an unknown host is reported as such.
        (url.host(), url.port())
            .to_socket_addrs()
            .map_err(|source| SessionError::UnknownHost {
                host: url.host().to_string(),
                source,
            })?;

        let options = SessionOptions::from_config(&self.config, &url)?;
        let settings = build_ldap_settings(&options)?;
        let inner = LdapConn::with_settings(settings, &url.server_url()).map_err(map_ldap_error)?;
        debug!(url = %url.server_url(), "opened LDAP session");
        Ok(Box::new(RealLdapSession {
            inner,
            operation_timeout: self.config.read_timeout(),
        }))
    }
}

struct RealLdapSession {
    inner: LdapConn,
    operation_timeout: Duration,
}

impl LdapSession for RealLdapSession {
    fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), SessionError> {
        let result = self
            .inner
            .with_timeout(self.operation_timeout)
            .simple_bind(dn, password)
            .map_err(map_ldap_error)?;
        ensure_success(result)
    }

    fn search(&mut self, request: &SearchRequest) -> Result<SearchPage, SessionError> {
        let mut controls = Vec::new();
        if let Some(page) = &request.page {
            let mut paged: RawControl = PagedResults {
                size: i32::try_from(page.size).unwrap_or(i32::MAX),
                cookie: page.cookie.clone(),
            }
            .into();
            paged.crit = true;
            controls.push(paged);
        }
        if let Some(sort) = &request.sort {
            let sort = sort_request_control(sort)
                .map_err(|err| SessionError::Protocol(format!("sort control: {err}")))?;
            controls.push(sort);
        }

        let options = SearchOptions::new()
            .sizelimit(i32::try_from(request.size_limit).unwrap_or(i32::MAX))
            .timelimit(i32::try_from(request.time_limit.as_secs()).unwrap_or(i32::MAX));
        let attributes = if request.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            request.attributes.clone()
        };

        let SearchResult(results, result) = self
            .inner
            .with_timeout(self.operation_timeout)
            .with_search_options(options)
            .with_controls(controls)
            .search(&request.base, scope(request.scope), &request.filter, attributes)
            .map_err(map_ldap_error)?;

        let truncated = match result.rc {
            RC_SUCCESS | RC_REFERRAL => false,
            RC_SIZE_LIMIT_EXCEEDED => true,
            code => return Err(SessionError::result(code, result.matched, result.text)),
        };

        let mut referrals = result.refs.clone();
        let entries = collect_entries(results);
        referrals.dedup();

        let cookie = result.ctrls.iter().find_map(|Control(kind, raw)| match kind {
            Some(ControlType::PagedResults) => Some(raw.parse::<PagedResults>().cookie),
            _ => None,
        });

        Ok(SearchPage {
            entries,
            cookie,
            truncated,
            referrals,
        })
    }

    fn add(&mut self, dn: &str, attributes: &[RawAttribute]) -> Result<(), SessionError> {
        let attrs = attributes
            .iter()
            .map(|(name, values)| {
                (
                    name.as_bytes().to_vec(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                )
            })
            .collect::<Vec<_>>();
        let result = self
            .inner
            .with_timeout(self.operation_timeout)
            .add(dn, attrs)
            .map_err(map_ldap_error)?;
        ensure_success(result)
    }

    fn modify(
        &mut self,
        dn: &str,
        modifications: &[DirectoryModification],
    ) -> Result<(), SessionError> {
        let mods = modifications
            .iter()
            .map(|m| match m {
                DirectoryModification::Add { attribute, values } => Mod::Add(
                    attribute.as_bytes().to_vec(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                ),
                DirectoryModification::Delete { attribute, values } => Mod::Delete(
                    attribute.as_bytes().to_vec(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                ),
                DirectoryModification::Replace { attribute, values } => Mod::Replace(
                    attribute.as_bytes().to_vec(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                ),
            })
            .collect::<Vec<_>>();

        let result = self
            .inner
            .with_timeout(self.operation_timeout)
            .modify(dn, mods)
            .map_err(map_ldap_error)?;
        ensure_success(result)
    }

    fn delete(&mut self, dn: &str) -> Result<(), SessionError> {
        let result = self
            .inner
            .with_timeout(self.operation_timeout)
            .delete(dn)
            .map_err(map_ldap_error)?;
        ensure_success(result)
    }

    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<String>,
    ) -> Result<(), SessionError> {
        let result = self
            .inner
            .with_timeout(self.operation_timeout)
            .modifydn(dn, new_rdn, true, new_superior.as_deref())
            .map_err(map_ldap_error)?;
        ensure_success(result)
    }

    fn unbind(&mut self) -> Result<(), SessionError> {
        self.inner.unbind().map_err(map_ldap_error)
    }
}

const fn scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Object => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::SubTree => Scope::Subtree,
    }
}

/// Keeps the entries of a search response. References travel in the result and
/// intermediate responses carry no entry.
fn collect_entries(results: Vec<ResultEntry>) -> Vec<RawEntry> {
    results
        .into_iter()
        .filter(|entry| !entry.is_ref() && !entry.is_intermediate())
        .map(|entry| {
            let entry = SearchEntry::construct(entry);
            RawEntry {
                dn: entry.dn,
                relative: false,
                attrs: entry.attrs,
                bin_attrs: entry.bin_attrs,
            }
        })
        .collect()
}

/// Extended property that upgrades `ldap://` sessions with StartTLS.
pub const STARTTLS_PROPERTY: &str = "starttls";

/// Transport setup of a session, from the named fields and the extended properties this
/// backend understands.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionOptions {
    connect_timeout: Duration,
    starttls: bool,
    tls_verify: bool,
    ca_cert: Option<PathBuf>,
}

impl SessionOptions {
    fn from_config(config: &ConnectionConfig, url: &LdapUrl) -> Result<Self, SessionError> {
        let starttls = match config.extended_property(STARTTLS_PROPERTY).map(str::trim) {
            None | Some("") => false,
            Some(value) => value.parse().map_err(|_| {
                SessionError::Protocol(format!(
                    "extended property `{STARTTLS_PROPERTY}` has invalid value `{value}`"
                ))
            })?,
        };
        if starttls && url.is_secure() {
            return Err(SessionError::Protocol(
                "StartTLS cannot be used with an ldaps URL".to_string(),
            ));
        }
        for key in config.extended.keys().filter(|key| key.as_str() != STARTTLS_PROPERTY) {
            debug!(property = %key, "extended property not used by the ldap3 backend");
        }

        Ok(Self {
            connect_timeout: config.connect_timeout(),
            starttls,
            tls_verify: config.tls_verify,
            ca_cert: config.tls_ca_cert.clone(),
        })
    }
}

fn build_ldap_settings(options: &SessionOptions) -> Result<LdapConnSettings, SessionError> {
    let mut settings = LdapConnSettings::new()
        .set_conn_timeout(options.connect_timeout)
        .set_starttls(options.starttls);

    if !options.tls_verify {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| tls_failure("failed to construct TLS connector", err))?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = &options.ca_cert {
        let pem = fs::read(cert_path).map_err(|err| SessionError::Transport {
            message: format!("failed to read CA certificate {}", cert_path.display()),
            source: Some(Box::new(err)),
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| tls_failure("invalid CA certificate", err))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| tls_failure("failed to load CA certificate", err))?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

fn tls_failure(message: &str, err: native_tls::Error) -> SessionError {
    SessionError::Transport {
        message: format!("{message}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn map_ldap_error(err: LdapError) -> SessionError {
    match err {
        LdapError::LdapResult { result } => {
            SessionError::result(result.rc, result.matched, result.text)
        }
        LdapError::Timeout { .. } => SessionError::Timeout {
            operation: "LDAP operation",
        },
        LdapError::FilterParsing => SessionError::Protocol("invalid search filter".to_string()),
        other => SessionError::Transport {
            message: other.to_string(),
            source: Some(Box::new(other)),
        },
    }
}

fn ensure_success(result: ldap3::LdapResult) -> Result<(), SessionError> {
    if result.rc == RC_SUCCESS {
        Ok(())
    } else {
        Err(SessionError::result(result.rc, result.matched, result.text))
    }
}
