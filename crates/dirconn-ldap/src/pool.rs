//! Identity-scoped session pool.
//!
//! Sessions are grouped by the URL and principal they were bound with. Each group (a slot) is
//! filled to the initial size on first use, never grows past the maximum, and drops sessions
//! that sat idle longer than the pool timeout. Checkout and return on one slot are serialized
//! by the slot's lock. The slot key holds no password: an idle session is bound again with the
//! presented credentials before it is handed out.

use crate::session::{DetachedSession, LdapSession, SessionConnector, SessionError};
use dirconn_core::{ConnectionConfig, Credentials};
use parking_lot::{Condvar, Mutex};
use secrecy::ExposeSecret;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity a pooled session is bound with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    url: String,
    bind_dn: Option<String>,
}

impl PoolKey {
    /// Key for `credentials` against `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, credentials: &Credentials) -> Self {
        Self {
            url: url.into(),
            bind_dn: credentials.dn().map(str::to_ascii_lowercase),
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Sessions opened when a slot is first used.
    pub initial_size: usize,
    /// Maximum sessions per slot, leased or idle; zero is unbounded.
    pub max_size: usize,
    /// Idle time after which a session is evicted; `None` keeps sessions forever.
    pub idle_timeout: Option<Duration>,
    /// How long a checkout waits for a session to come back when the slot is full.
    pub checkout_timeout: Duration,
}

impl PoolSettings {
    /// Settings taken from a connection configuration.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            initial_size: config.initial_pool_size as usize,
            max_size: config.max_pool_size as usize,
            idle_timeout: config.pool_timeout(),
            checkout_timeout: config.connect_timeout(),
        }
    }

    fn has_room(&self, open: usize) -> bool {
        self.max_size == 0 || open < self.max_size
    }
}

struct IdleSession {
    session: Box<dyn LdapSession>,
    since: Instant,
}

#[derive(Default)]
struct SlotState {
    idle: VecDeque<IdleSession>,
    leased: usize,
    primed: bool,
}

struct PoolSlot {
    state: Mutex<SlotState>,
    available: Condvar,
}

/// Pool of bound sessions, shared between connections.
pub struct SessionPool {
    settings: PoolSettings,
    connector: Arc<dyn SessionConnector>,
    slots: Mutex<HashMap<PoolKey, Arc<PoolSlot>>>,
}

impl SessionPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(settings: PoolSettings, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            settings,
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Sizing of this pool.
    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Connector used to open new sessions.
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn SessionConnector> {
        &self.connector
    }

    /// Number of idle sessions held for `key`.
    #[must_use]
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.slots
            .lock()
            .get(key)
            .map_or(0, |slot| slot.state.lock().idle.len())
    }

    /// Number of sessions currently leased for `key`.
    #[must_use]
    pub fn leased_count(&self, key: &PoolKey) -> usize {
        self.slots
            .lock()
            .get(key)
            .map_or(0, |slot| slot.state.lock().leased)
    }

    /// Leases a session bound with `credentials`.
    ///
    /// # Errors
    ///
    /// Returns the connect or bind failure of a new session, or a transport failure when the
    /// slot stays full for the whole checkout timeout.
    pub fn checkout(
        &self,
        key: &PoolKey,
        credentials: &Credentials,
    ) -> Result<PooledSession, SessionError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock();

        if !state.primed {
            for _ in 0..self.settings.initial_size {
                if !self.settings.has_room(state.idle.len() + state.leased) {
                    break;
                }
                let session = open_session(self.connector.as_ref(), credentials)?;
                state.idle.push_back(IdleSession {
                    session,
                    since: Instant::now(),
                });
            }
            state.primed = true;
            debug!(idle = state.idle.len(), "primed pool slot");
        }

        let deadline = Instant::now() + self.settings.checkout_timeout;
        loop {
            self.evict_expired(&mut state);

            if let Some(mut idle) = state.idle.pop_back() {
                match rebind(idle.session.as_mut(), credentials) {
                    Ok(()) => {
                        state.leased += 1;
                        return Ok(PooledSession::new(idle.session, slot.clone()));
                    }
                    Err(err) if err.code().is_some() => {
                        debug!(code = err.code(), "pooled session rejected credentials");
                        let _ = idle.session.unbind();
                        slot.available.notify_one();
                        return Err(err);
                    }
                    Err(err) => {
                        debug!(error = %err, "discarding stale pooled session");
                        let _ = idle.session.unbind();
                        continue;
                    }
                }
            }

            if self.settings.has_room(state.leased) {
                let session = open_session(self.connector.as_ref(), credentials)?;
                state.leased += 1;
                return Ok(PooledSession::new(session, slot.clone()));
            }

            if slot.available.wait_until(&mut state, deadline).timed_out() {
                warn!(
                    max_size = self.settings.max_size,
                    "connection pool exhausted"
                );
                return Err(SessionError::transport("connection pool exhausted"));
            }
        }
    }

    fn slot(&self, key: &PoolKey) -> Arc<PoolSlot> {
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(PoolSlot {
                    state: Mutex::new(SlotState::default()),
                    available: Condvar::new(),
                })
            })
            .clone()
    }

    fn evict_expired(&self, state: &mut SlotState) {
        let Some(timeout) = self.settings.idle_timeout else {
            return;
        };
        while state
            .idle
            .front()
            .is_some_and(|idle| idle.since.elapsed() >= timeout)
        {
            if let Some(mut expired) = state.idle.pop_front() {
                debug!("evicting idle pooled session");
                if let Err(err) = expired.session.unbind() {
                    debug!(error = %err, "unbind of evicted session failed");
                }
            }
        }
    }
}

/// Connects a session and binds it when `credentials` name a principal.
pub(crate) fn open_session(
    connector: &dyn SessionConnector,
    credentials: &Credentials,
) -> Result<Box<dyn LdapSession>, SessionError> {
    let mut session = connector.connect()?;
    if let Credentials::Simple { dn, password } = credentials {
        if let Err(err) = session.simple_bind(dn, password.expose_secret()) {
            let _ = session.unbind();
            return Err(err);
        }
    }
    Ok(session)
}

fn rebind(session: &mut dyn LdapSession, credentials: &Credentials) -> Result<(), SessionError> {
    match credentials {
        Credentials::Simple { dn, password } => session.simple_bind(dn, password.expose_secret()),
        Credentials::Anonymous => Ok(()),
    }
}

/// A session leased from a [`SessionPool`]; handed back when dropped unless marked broken.
pub struct PooledSession {
    session: Box<dyn LdapSession>,
    slot: Arc<PoolSlot>,
    broken: bool,
}

impl PooledSession {
    fn new(session: Box<dyn LdapSession>, slot: Arc<PoolSlot>) -> Self {
        Self {
            session,
            slot,
            broken: false,
        }
    }

    /// The leased session.
    pub fn session(&mut self) -> &mut dyn LdapSession {
        self.session.as_mut()
    }

    /// Discards the session instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let mut session = std::mem::replace(&mut self.session, Box::new(DetachedSession));
        {
            let mut state = self.slot.state.lock();
            state.leased = state.leased.saturating_sub(1);
            if !self.broken {
                state.idle.push_back(IdleSession {
                    session,
                    since: Instant::now(),
                });
                self.slot.available.notify_one();
                return;
            }
            self.slot.available.notify_one();
        }
        debug!("discarding broken pooled session");
        let _ = session.unbind();
    }
}

/// Session held by a connection or a paged cursor.
pub enum SessionLease {
    /// A session owned outright; unbound on release.
    Owned(Box<dyn LdapSession>),
    /// A session borrowed from a pool; returned on release.
    Pooled(PooledSession),
}

impl SessionLease {
    /// The underlying session.
    pub fn session(&mut self) -> &mut dyn LdapSession {
        match self {
            Self::Owned(session) => session.as_mut(),
            Self::Pooled(pooled) => pooled.session(),
        }
    }

    /// Prevents a pooled session from being reused.
    pub fn mark_broken(&mut self) {
        if let Self::Pooled(pooled) = self {
            pooled.mark_broken();
        }
    }

    /// Releases the session: unbinds an owned session, returns a pooled one.
    ///
    /// # Errors
    ///
    /// Returns the unbind failure of an owned session.
    pub fn release(self) -> Result<(), SessionError> {
        match self {
            Self::Owned(mut session) => session.unbind(),
            Self::Pooled(pooled) => {
                drop(pooled);
                Ok(())
            }
        }
    }
}
