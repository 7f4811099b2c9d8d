//! Result cursors.
//!
//! A plain search is answered in one round trip, so [`SimpleResultCursor`] only buffers it.
//! [`PagedResultCursor`] owns a dedicated session and walks RFC 2696 pages: a page is fetched
//! only once the previous one is drained and the server handed back a non-empty cookie.

use crate::pool::SessionLease;
use crate::session::{
    LdapSession, PageRequest, RawEntry, SearchPage, SearchRequest, RC_SIZE_LIMIT_EXCEEDED,
};
use crate::translate::translate;
use dirconn_core::{
    Attribute, AttributeValue, Entry, Error, ErrorKind, NativeCategory, NativeFailure, Referral,
    Result, ResultCursor,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of a connection's session generation, taken when a cursor is created.
#[derive(Debug, Clone)]
pub(crate) struct GenerationTicket {
    counter: Arc<AtomicU64>,
    issued: u64,
}

impl GenerationTicket {
    pub(crate) fn issue(counter: &Arc<AtomicU64>) -> Self {
        Self {
            counter: counter.clone(),
            issued: counter.load(Ordering::Acquire),
        }
    }

    /// Fails once the originating session was closed or rebound.
    pub(crate) fn check(&self) -> Result<()> {
        if self.counter.load(Ordering::Acquire) == self.issued {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::CommunicationFailure,
                "the session this cursor was opened on has been closed",
            ))
        }
    }
}

/// Builds an entry from a raw search result. Relative names are resolved against `base`.
pub(crate) fn to_entry(raw: RawEntry, base: &str) -> Entry {
    let dn = if !raw.relative {
        raw.dn
    } else if raw.dn.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        raw.dn
    } else {
        format!("{},{base}", raw.dn)
    };

    let mut attributes = raw
        .attrs
        .into_iter()
        .map(|(name, values)| {
            Attribute::from_values(name, values.into_iter().map(AttributeValue::Text).collect())
        })
        .chain(raw.bin_attrs.into_iter().map(|(name, values)| {
            Attribute::from_values(name, values.into_iter().map(AttributeValue::Binary).collect())
        }))
        .collect::<Vec<_>>();
    attributes.sort_by(|a, b| a.name().cmp(b.name()));

    let mut entry = Entry::new(dn);
    for attribute in attributes {
        entry.add_attribute(attribute);
    }
    entry
}

/// Runs one search round trip, applying the request's referral policy.
///
/// A size-limit failure is reported as a truncated, empty page.
pub(crate) fn fetch_page(
    session: &mut dyn LdapSession,
    request: &SearchRequest,
) -> Result<SearchPage> {
    let page = match session.search(request) {
        Ok(page) => page,
        Err(err) if err.code() == Some(RC_SIZE_LIMIT_EXCEEDED) => SearchPage {
            truncated: true,
            ..SearchPage::default()
        },
        Err(err) => return Err(translate(err)),
    };

    if !page.referrals.is_empty() {
        match request.referral {
            Referral::Throw => {
                return Err(Error::translate(
                    NativeFailure::new(
                        NativeCategory::Referral,
                        format!(
                            "search below {} returned referrals: {}",
                            request.base,
                            page.referrals.join(", ")
                        ),
                    )
                    .with_code("10"),
                ));
            }
            Referral::Ignore => {
                debug!(base = %request.base, count = page.referrals.len(), "ignoring referrals");
            }
            Referral::Follow => {
                debug!(base = %request.base, "referrals are not chased");
            }
        }
    }
    Ok(page)
}

fn size_limit_reached(base: &str) {
    warn!(base, "size limit reached, remaining results are unavailable");
}

/// Cursor over the buffered results of a plain search.
pub struct SimpleResultCursor {
    base: String,
    entries: VecDeque<Entry>,
    truncated: bool,
    closed: bool,
    ticket: GenerationTicket,
}

impl SimpleResultCursor {
    pub(crate) fn new(page: SearchPage, base: &str, ticket: GenerationTicket) -> Self {
        Self {
            base: base.to_string(),
            entries: page
                .entries
                .into_iter()
                .map(|raw| to_entry(raw, base))
                .collect(),
            truncated: page.truncated,
            closed: false,
            ticket,
        }
    }
}

impl ResultCursor for SimpleResultCursor {
    fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        self.ticket.check()?;
        if !self.entries.is_empty() {
            return Ok(true);
        }
        if self.truncated {
            self.truncated = false;
            size_limit_reached(&self.base);
        }
        Ok(false)
    }

    fn next_entry(&mut self) -> Result<Entry> {
        if !self.has_next()? {
            return Err(end_of_results());
        }
        self.entries.pop_front().ok_or_else(end_of_results)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.entries.clear();
        Ok(())
    }
}

enum PageState {
    Active {
        page: VecDeque<Entry>,
        cookie: Vec<u8>,
        truncated: bool,
    },
    Exhausted,
}

impl PageState {
    fn from_page(page: SearchPage, base: &str) -> Self {
        Self::Active {
            page: page
                .entries
                .into_iter()
                .map(|raw| to_entry(raw, base))
                .collect(),
            cookie: page.cookie.unwrap_or_default(),
            truncated: page.truncated,
        }
    }
}

/// Cursor driving an RFC 2696 paged search on its own session.
pub struct PagedResultCursor {
    lease: Option<SessionLease>,
    request: SearchRequest,
    state: PageState,
    ticket: GenerationTicket,
}

impl PagedResultCursor {
    /// Fetches the first page. The lease is released if that fails.
    pub(crate) fn start(
        mut lease: SessionLease,
        request: SearchRequest,
        ticket: GenerationTicket,
    ) -> Result<Self> {
        match fetch_page(lease.session(), &request) {
            Ok(page) => {
                let state = PageState::from_page(page, &request.base);
                Ok(Self {
                    lease: Some(lease),
                    request,
                    state,
                    ticket,
                })
            }
            Err(err) => {
                if err.kind() == ErrorKind::CommunicationFailure {
                    lease.mark_broken();
                }
                if let Err(release) = lease.release() {
                    debug!(error = %release, "failed to release paging session");
                }
                Err(err)
            }
        }
    }

    fn fetch(&mut self, cookie: Vec<u8>) -> Result<PageState> {
        let request = self.request.with_cookie(cookie);
        let lease = self.lease.as_mut().ok_or_else(|| {
            Error::new(
                ErrorKind::CommunicationFailure,
                "paged search session is closed",
            )
        })?;
        debug!(base = %request.base, "requesting next page");
        match fetch_page(lease.session(), &request) {
            Ok(page) => Ok(PageState::from_page(page, &request.base)),
            Err(err) => {
                if err.kind() == ErrorKind::CommunicationFailure {
                    lease.mark_broken();
                }
                Err(err)
            }
        }
    }
}

impl ResultCursor for PagedResultCursor {
    fn has_next(&mut self) -> Result<bool> {
        loop {
            let cookie = match &mut self.state {
                PageState::Exhausted => return Ok(false),
                PageState::Active { page, .. } if !page.is_empty() => {
                    self.ticket.check()?;
                    return Ok(true);
                }
                PageState::Active {
                    truncated: true, ..
                } => {
                    size_limit_reached(&self.request.base);
                    None
                }
                PageState::Active { cookie, .. } => {
                    Some(std::mem::take(cookie)).filter(|cookie| !cookie.is_empty())
                }
            };

            let Some(cookie) = cookie else {
                self.state = PageState::Exhausted;
                return Ok(false);
            };

            if let Err(err) = self.ticket.check() {
                self.state = PageState::Exhausted;
                return Err(err);
            }
            match self.fetch(cookie) {
                Ok(state) => self.state = state,
                Err(err) => {
                    self.state = PageState::Exhausted;
                    return Err(err);
                }
            }
        }
    }

    fn next_entry(&mut self) -> Result<Entry> {
        if !self.has_next()? {
            return Err(end_of_results());
        }
        match &mut self.state {
            PageState::Active { page, .. } => page.pop_front().ok_or_else(end_of_results),
            PageState::Exhausted => Err(end_of_results()),
        }
    }

    fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, PageState::Exhausted);
        let Some(mut lease) = self.lease.take() else {
            return Ok(());
        };

        let mut outcome = Ok(());
        if let PageState::Active { cookie, .. } = state {
            if !cookie.is_empty() {
                // A zero-size page request tells the server to drop the paged search.
                let mut abandon = self.request.clone();
                abandon.page = Some(PageRequest { size: 0, cookie });
                if let Err(err) = lease.session().search(&abandon) {
                    warn!(error = %err, "failed to abandon paged search");
                    outcome = Err(translate(err));
                }
            }
        }

        if let Err(err) = lease.release() {
            warn!(error = %err, "failed to close paging session");
            if outcome.is_ok() {
                outcome = Err(translate(err));
            }
        }
        outcome
    }
}

impl Drop for PagedResultCursor {
    fn drop(&mut self) {
        if self.lease.is_some() {
            if let Err(err) = self.close() {
                debug!(error = %err, "paged cursor dropped with close failure");
            }
        }
    }
}

fn end_of_results() -> Error {
    Error::new(ErrorKind::EndOfResults, "no more search results")
}
