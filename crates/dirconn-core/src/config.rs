//! Connection configuration.
//!
//! A [`ConnectionConfig`] can be built in code with the `with_*` setters or read from the
//! string-keyed property form used by hosts (see [`keys`]). Named fields always take precedence
//! over the free-form extended properties.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use validator::{Validate, ValidationError};

/// Property keys understood by [`ConnectionConfig::from_properties`].
pub mod keys {
    /// Connection implementation identifier.
    pub const TYPE: &str = "type";
    /// Directory URL.
    pub const URL: &str = "url";
    /// Authentication mode (`none` or `simple`).
    pub const AUTHENTICATION: &str = "authentication";
    /// Number of sessions opened when a pool slot is first used.
    pub const INITIAL_POOL_SIZE: &str = "initialPoolSize";
    /// Upper bound of sessions per pool slot.
    pub const MAX_POOL_SIZE: &str = "maxPoolSize";
    /// Idle time in milliseconds after which pooled sessions are evicted.
    pub const POOL_TIMEOUT: &str = "poolTimeout";
    /// Referral policy (`follow`, `ignore` or `throw`).
    pub const REFERRAL: &str = "referral";
    /// Connect timeout in milliseconds.
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    /// Per-operation read timeout in milliseconds.
    pub const READ_TIMEOUT: &str = "readTimeout";
    /// Whether TLS certificates are verified.
    pub const TLS_VERIFY: &str = "tlsVerify";
    /// Path to a PEM CA certificate.
    pub const TLS_CA_CERT: &str = "tlsCaCert";

    pub(crate) const NAMED: &[&str] = &[
        TYPE,
        URL,
        AUTHENTICATION,
        INITIAL_POOL_SIZE,
        MAX_POOL_SIZE,
        POOL_TIMEOUT,
        REFERRAL,
        CONNECT_TIMEOUT,
        READ_TIMEOUT,
        TLS_VERIFY,
        TLS_CA_CERT,
    ];
}

/// Default connection implementation identifier.
pub const DEFAULT_CONNECTION_TYPE: &str = "ldap3";
/// Default LDAP port.
pub const DEFAULT_LDAP_PORT: u16 = 389;
/// Default LDAPS port.
pub const DEFAULT_LDAPS_PORT: u16 = 636;
/// Default connect timeout (milliseconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default read timeout (milliseconds).
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

/// How the connection authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMode {
    /// Anonymous access.
    None,
    /// Simple bind with DN and password.
    #[default]
    Simple,
}

impl AuthenticationMode {
    /// Property value of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Simple => "simple",
        }
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "simple" => Ok(Self::Simple),
            other => Err(Error::configuration(format!(
                "unsupported authentication mode `{other}`"
            ))),
        }
    }
}

/// What to do when the server answers with a referral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Referral {
    /// Accept the referral. Referrals are not chased; the referring data is skipped.
    Follow,
    /// Treat the referral as the end of the data.
    #[default]
    Ignore,
    /// Surface the referral as an error.
    Throw,
}

impl Referral {
    /// Property value of the policy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Ignore => "ignore",
            Self::Throw => "throw",
        }
    }
}

impl fmt::Display for Referral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Referral {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "follow" => Ok(Self::Follow),
            "ignore" => Ok(Self::Ignore),
            "throw" => Ok(Self::Throw),
            other => Err(Error::configuration(format!(
                "unsupported referral policy `{other}`"
            ))),
        }
    }
}

/// Parsed `ldap[s]://host[:port][/baseDN]` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LdapUrl {
    secure: bool,
    host: String,
    port: u16,
    base_dn: Option<String>,
}

impl LdapUrl {
    /// Parses a directory URL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::Configuration`] when the URL is malformed, uses a scheme
    /// other than `ldap`/`ldaps`, or has no host.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())?;
        let secure = match url.scheme() {
            "ldap" => false,
            "ldaps" => true,
            other => {
                return Err(Error::configuration(format!(
                    "unsupported URL scheme `{other}`, expected ldap or ldaps"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::configuration(format!("directory URL `{raw}` has no host")))?
            .to_string();
        let port = url.port().unwrap_or(if secure {
            DEFAULT_LDAPS_PORT
        } else {
            DEFAULT_LDAP_PORT
        });
        let path = url.path().trim_start_matches('/');
        let base_dn = if path.is_empty() {
            None
        } else {
            let decoded = urlencoding::decode(path).map_err(|err| {
                Error::configuration(format!("invalid base DN in `{raw}`: {err}"))
            })?;
            Some(decoded.into_owned())
        };
        Ok(Self {
            secure,
            host,
            port,
            base_dn,
        })
    }

    /// True for `ldaps`.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// Server host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port, defaulted from the scheme when absent.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Base DN carried in the URL path, if any.
    #[must_use]
    pub fn base_dn(&self) -> Option<&str> {
        self.base_dn.as_deref()
    }

    /// URL of the server without the base DN, with the port spelled out.
    #[must_use]
    pub fn server_url(&self) -> String {
        let scheme = if self.secure { "ldaps" } else { "ldap" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.server_url())?;
        if let Some(base_dn) = &self.base_dn {
            write!(f, "/{}", urlencoding::encode(base_dn))?;
        }
        Ok(())
    }
}

impl FromStr for LdapUrl {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

/// Configuration of one directory connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_pool_bounds"))]
pub struct ConnectionConfig {
    /// Directory URL, `ldap[s]://host[:port][/baseDN]`
    #[validate(custom(function = "validate_ldap_url"))]
    pub url: String,

    /// Connection implementation identifier
    #[validate(length(min = 1))]
    #[serde(default = "default_connection_type")]
    pub connection_type: String,

    /// Authentication mode
    #[serde(default)]
    pub authentication: AuthenticationMode,

    /// Sessions opened when a pool slot is first used; zero disables pooling
    #[serde(default)]
    pub initial_pool_size: u32,

    /// Maximum sessions per pool slot; zero is unbounded
    #[serde(default)]
    pub max_pool_size: u32,

    /// Idle eviction time in milliseconds; zero keeps idle sessions forever
    #[serde(default)]
    pub pool_timeout_ms: u64,

    /// Referral policy
    #[serde(default)]
    pub referral: Referral,

    /// Connect timeout in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-operation read timeout in milliseconds
    #[validate(range(min = 1))]
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Whether to verify TLS certificates
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// Optional path to a custom CA certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Provider-specific properties, overridden by every named field
    #[serde(default)]
    pub extended: BTreeMap<String, String>,
}

fn default_connection_type() -> String {
    DEFAULT_CONNECTION_TYPE.to_string()
}

const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

const fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

const fn default_tls_verify() -> bool {
    true
}

fn validate_ldap_url(url: &str) -> std::result::Result<(), ValidationError> {
    LdapUrl::parse(url)
        .map(|_| ())
        .map_err(|_| ValidationError::new("ldap_url"))
}

fn validate_pool_bounds(config: &ConnectionConfig) -> std::result::Result<(), ValidationError> {
    if config.max_pool_size > 0 && config.max_pool_size < config.initial_pool_size {
        return Err(ValidationError::new("pool_bounds"));
    }
    Ok(())
}

impl ConnectionConfig {
    /// Creates a configuration for `url` with every other field defaulted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::Configuration`] if the URL is invalid.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let config = Self {
            url: url.into(),
            connection_type: default_connection_type(),
            authentication: AuthenticationMode::default(),
            initial_pool_size: 0,
            max_pool_size: 0,
            pool_timeout_ms: 0,
            referral: Referral::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            tls_verify: default_tls_verify(),
            tls_ca_cert: None,
            extended: BTreeMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration from its string-keyed property form.
    ///
    /// Keys listed in [`keys`] fill the named fields; blank values keep the default. Every other
    /// key is kept as an extended property.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::Configuration`] when the URL is missing or any value cannot
    /// be parsed.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let lookup = |key: &str| {
            properties
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let url = lookup(keys::URL)
            .ok_or_else(|| Error::configuration(format!("property `{}` is required", keys::URL)))?;
        let mut config = Self::new(url)?;

        if let Some(value) = lookup(keys::TYPE) {
            config.connection_type = value.to_string();
        }
        if let Some(value) = lookup(keys::AUTHENTICATION) {
            config.authentication = value.parse()?;
        }
        if let Some(value) = lookup(keys::INITIAL_POOL_SIZE) {
            config.initial_pool_size = parse_value(keys::INITIAL_POOL_SIZE, value)?;
        }
        if let Some(value) = lookup(keys::MAX_POOL_SIZE) {
            config.max_pool_size = parse_value(keys::MAX_POOL_SIZE, value)?;
        }
        if let Some(value) = lookup(keys::POOL_TIMEOUT) {
            config.pool_timeout_ms = parse_value(keys::POOL_TIMEOUT, value)?;
        }
        if let Some(value) = lookup(keys::REFERRAL) {
            config.referral = value.parse()?;
        }
        if let Some(value) = lookup(keys::CONNECT_TIMEOUT) {
            config.connect_timeout_ms = parse_value(keys::CONNECT_TIMEOUT, value)?;
        }
        if let Some(value) = lookup(keys::READ_TIMEOUT) {
            config.read_timeout_ms = parse_value(keys::READ_TIMEOUT, value)?;
        }
        if let Some(value) = lookup(keys::TLS_VERIFY) {
            config.tls_verify = parse_value(keys::TLS_VERIFY, value)?;
        }
        if let Some(value) = lookup(keys::TLS_CA_CERT) {
            config.tls_ca_cert = Some(PathBuf::from(value));
        }

        config.extended = properties
            .iter()
            .filter(|(key, _)| !keys::NAMED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        config.validate()?;
        Ok(config)
    }

    /// Emits the property form: extended properties overlaid with every named field.
    #[must_use]
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut properties = self.extended.clone();
        let mut put = |key: &str, value: String| {
            properties.insert(key.to_string(), value);
        };
        put(keys::TYPE, self.connection_type.clone());
        put(keys::URL, self.url.clone());
        put(keys::AUTHENTICATION, self.authentication.to_string());
        put(keys::INITIAL_POOL_SIZE, self.initial_pool_size.to_string());
        put(keys::MAX_POOL_SIZE, self.max_pool_size.to_string());
        put(keys::POOL_TIMEOUT, self.pool_timeout_ms.to_string());
        put(keys::REFERRAL, self.referral.to_string());
        put(keys::CONNECT_TIMEOUT, self.connect_timeout_ms.to_string());
        put(keys::READ_TIMEOUT, self.read_timeout_ms.to_string());
        put(keys::TLS_VERIFY, self.tls_verify.to_string());
        if let Some(path) = &self.tls_ca_cert {
            put(keys::TLS_CA_CERT, path.display().to_string());
        }
        properties
    }

    /// Parses the URL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::Configuration`] if the URL is invalid.
    pub fn ldap_url(&self) -> Result<LdapUrl> {
        LdapUrl::parse(&self.url)
    }

    /// Returns true when sessions are drawn from a pool.
    #[must_use]
    pub const fn pool_enabled(&self) -> bool {
        self.initial_pool_size > 0
    }

    /// Idle eviction time, `None` when idle sessions are never evicted.
    #[must_use]
    pub const fn pool_timeout(&self) -> Option<Duration> {
        if self.pool_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.pool_timeout_ms))
        }
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-operation read timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Looks up an extended property.
    #[must_use]
    pub fn extended_property(&self, key: &str) -> Option<&str> {
        self.extended.get(key).map(String::as_str)
    }

    /// Sets the connection implementation identifier.
    #[must_use]
    pub fn with_connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = connection_type.into();
        self
    }

    /// Sets the authentication mode.
    #[must_use]
    pub const fn with_authentication(mut self, mode: AuthenticationMode) -> Self {
        self.authentication = mode;
        self
    }

    /// Sets the initial and maximum pool sizes.
    #[must_use]
    pub const fn with_pool_size(mut self, initial: u32, max: u32) -> Self {
        self.initial_pool_size = initial;
        self.max_pool_size = max;
        self
    }

    /// Sets the pool idle timeout.
    #[must_use]
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the referral policy.
    #[must_use]
    pub const fn with_referral(mut self, referral: Referral) -> Self {
        self.referral = referral;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the per-operation read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub const fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Sets a custom CA certificate path.
    #[must_use]
    pub fn with_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }

    /// Adds an extended provider property.
    #[must_use]
    pub fn with_extended(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extended.insert(key.into(), value.into());
        self
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::configuration(format!("property `{key}` has invalid value `{value}`"))
    })
}
