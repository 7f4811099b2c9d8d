//! Connection and result cursor contracts.
//!
//! A [`Connection`] owns at most one bound session to a directory server and is used
//! sequentially through `&mut self`. Searches hand back a [`ResultCursor`] that lazily walks
//! the results, fetching further pages as it goes when paging was requested.

use crate::controls::SearchControls;
use crate::entry::{Attribute, AttributeValue, Entry, EntryMap};
use crate::error::{ErrorKind, Result};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use tracing::warn;

/// Principal name hosts use when they need a non-empty DN for an anonymous bind.
pub const ANONYMOUS_PRINCIPAL: &str = "ANONYMOUS";

/// Identity used to bind a connection.
pub enum Credentials {
    /// Unauthenticated access; no principal is recorded.
    Anonymous,
    /// Simple authentication.
    Simple {
        /// Principal DN.
        dn: String,
        /// Password.
        password: SecretString,
    },
}

impl Credentials {
    /// Simple credentials, or [`Credentials::Anonymous`] when `dn` is blank or the
    /// [`ANONYMOUS_PRINCIPAL`] sentinel.
    #[must_use]
    pub fn simple(dn: impl Into<String>, password: impl Into<String>) -> Self {
        let dn = dn.into();
        if dn.trim().is_empty() || dn.eq_ignore_ascii_case(ANONYMOUS_PRINCIPAL) {
            return Self::Anonymous;
        }
        Self::Simple {
            dn,
            password: SecretString::from(password.into()),
        }
    }

    /// Builds credentials from optional parts.
    #[must_use]
    pub fn from_parts(dn: Option<&str>, password: Option<&str>) -> Self {
        match dn {
            Some(dn) => Self::simple(dn, password.unwrap_or_default()),
            None => Self::Anonymous,
        }
    }

    /// Principal DN, `None` for anonymous.
    #[must_use]
    pub fn dn(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Simple { dn, .. } => Some(dn),
        }
    }

    /// Returns true for anonymous credentials.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        match self {
            Self::Anonymous => Self::Anonymous,
            Self::Simple { dn, password } => Self::Simple {
                dn: dn.clone(),
                password: SecretString::from(password.expose_secret().to_owned()),
            },
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Simple { dn, .. } => f
                .debug_struct("Simple")
                .field("dn", dn)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Lazy sequence of search results.
///
/// `has_next` is idempotent and is where page advancement happens; `next_entry` past the end
/// fails with [`ErrorKind::EndOfResults`].
pub trait ResultCursor: Send {
    /// Returns true if another entry is available, fetching the next page if needed.
    ///
    /// # Errors
    ///
    /// Returns a translated error when a page fetch fails or the originating session is gone.
    fn has_next(&mut self) -> Result<bool>;

    /// Returns the next entry.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::EndOfResults`] when the cursor is exhausted.
    fn next_entry(&mut self) -> Result<Entry>;

    /// Releases the cursor's resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first release failure; every resource is released regardless.
    fn close(&mut self) -> Result<()>;

    /// Drains the cursor, advancing pages transparently.
    ///
    /// # Errors
    ///
    /// Propagates the first failure.
    fn all_entries(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while self.has_next()? {
            entries.push(self.next_entry()?);
        }
        Ok(entries)
    }

    /// Discards up to `count` entries, returning how many were skipped.
    ///
    /// # Errors
    ///
    /// Propagates the first failure.
    fn skip_entries(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count && self.has_next()? {
            self.next_entry()?;
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Reads up to `size` entries. An empty batch means the cursor is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates the first failure.
    fn next_batch(&mut self, size: usize) -> Result<Vec<Entry>> {
        let mut batch = Vec::with_capacity(size.min(1024));
        while batch.len() < size && self.has_next()? {
            batch.push(self.next_entry()?);
        }
        Ok(batch)
    }

    /// Drains the cursor into batches of `size` entries; the last batch may be shorter.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidInput`] for a zero size, otherwise propagates the first
    /// failure.
    fn pages(&mut self, size: usize) -> Result<Vec<Vec<Entry>>> {
        if size == 0 {
            return Err(crate::Error::invalid_input("page size must be positive"));
        }
        let mut pages = Vec::new();
        loop {
            let batch = self.next_batch(size)?;
            if batch.is_empty() {
                return Ok(pages);
            }
            pages.push(batch);
        }
    }
}

impl dyn ResultCursor {
    /// Iterator over the remaining entries.
    pub fn entries(&mut self) -> Entries<'_> {
        Entries {
            cursor: self,
            done: false,
        }
    }
}

/// Iterator over a cursor's remaining entries. Stops after the first error.
pub struct Entries<'a> {
    cursor: &'a mut dyn ResultCursor,
    done: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.has_next() {
            Ok(true) => Some(self.cursor.next_entry()),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// A connection to one directory server, bound to at most one identity at a time.
///
/// Every backend failure leaving a method has already been translated into the
/// [`crate::Error`] taxonomy. Nothing is retried.
pub trait Connection: Send {
    /// Binds the connection, closing any existing session first.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AuthenticationFailed`] for rejected or unknown principals,
    /// [`ErrorKind::CommunicationFailure`] when the server cannot be reached.
    fn bind(&mut self, credentials: Credentials) -> Result<()>;

    /// Returns true if no session is open.
    fn is_closed(&self) -> bool;

    /// DN of the bound principal, `None` when anonymous or unbound.
    fn bound_user_dn(&self) -> Option<String>;

    /// Releases the session. Idempotent; the connection is closed even if an error is returned.
    ///
    /// # Errors
    ///
    /// Returns the failure reported while releasing the session.
    fn close(&mut self) -> Result<()>;

    /// Runs a search, returning a paged cursor when `controls` enable paging.
    ///
    /// # Errors
    ///
    /// Returns a translated error if the search cannot be started.
    fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
        controls: &SearchControls,
    ) -> Result<Box<dyn ResultCursor>>;

    /// Reads exactly one entry. `None` returns every user attribute.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NameNotFound`] if the entry does not exist.
    fn lookup(&mut self, dn: &str, attributes: Option<&[String]>) -> Result<Entry>;

    /// Creates an entry.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NameAlreadyBound`] if the DN is taken.
    fn add_entry(&mut self, entry: &Entry) -> Result<()>;

    /// Replaces the values of every attribute present in `entry`. Attributes absent from
    /// `entry` are left untouched.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn update_entry(&mut self, entry: &Entry) -> Result<()>;

    /// Deletes a leaf entry. Deleting a missing entry whose parent exists succeeds.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NameNotFound`] when the parent is missing, [`ErrorKind::ContextNotEmpty`]
    /// for non-leaf entries.
    fn delete_entry(&mut self, dn: &str) -> Result<()>;

    /// Moves or renames an entry.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn rename_entry(&mut self, old_dn: &str, new_dn: &str) -> Result<()>;

    /// Adds values to an attribute, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn add_attribute(&mut self, dn: &str, attribute: &Attribute) -> Result<()>;

    /// Replaces every value of an attribute.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn update_attribute(&mut self, dn: &str, attribute: &Attribute) -> Result<()>;

    /// Deletes the listed values, or the whole attribute when it holds none.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn delete_attribute(&mut self, dn: &str, attribute: &Attribute) -> Result<()>;

    /// Deletes the entry identified by `entry`'s DN.
    ///
    /// # Errors
    ///
    /// See [`Connection::delete_entry`].
    fn delete(&mut self, entry: &Entry) -> Result<()> {
        self.delete_entry(entry.dn())
    }

    /// Returns true if an entry exists at `dn`.
    ///
    /// # Errors
    ///
    /// Any failure other than [`ErrorKind::NameNotFound`].
    fn exists(&mut self, dn: &str) -> Result<bool> {
        let no_attributes = ["1.1".to_string()];
        match self.lookup(dn, Some(&no_attributes)) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NameNotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Returns the first matching entry. Logs a warning when more than one matched.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn search_one(
        &mut self,
        base_dn: &str,
        filter: &str,
        controls: &SearchControls,
    ) -> Result<Option<Entry>> {
        let mut cursor = self.search(base_dn, filter, controls)?;
        let outcome = read_first(cursor.as_mut(), base_dn, filter);
        let closed = cursor.close();
        let first = outcome?;
        closed?;
        Ok(first)
    }

    /// Runs a search and returns every result. The cursor is always closed.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn search_all(
        &mut self,
        base_dn: &str,
        filter: &str,
        controls: &SearchControls,
    ) -> Result<Vec<Entry>> {
        let mut cursor = self.search(base_dn, filter, controls)?;
        let outcome = cursor.all_entries();
        let closed = cursor.close();
        let entries = outcome?;
        closed?;
        Ok(entries)
    }

    /// Entry of the bound principal, `None` when anonymous or unbound.
    ///
    /// # Errors
    ///
    /// Returns a translated error if the lookup fails.
    fn bound_entry(&mut self, attributes: Option<&[String]>) -> Result<Option<Entry>> {
        match self.bound_user_dn() {
            Some(dn) => self.lookup(&dn, attributes).map(Some),
            None => Ok(None),
        }
    }

    /// Creates an entry from its map projection. A non-blank `dn` overrides the map's DN.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidInput`] when no DN is available, otherwise as
    /// [`Connection::add_entry`].
    fn add_entry_from_map(&mut self, dn: Option<&str>, map: EntryMap) -> Result<()> {
        let entry = Entry::from_map_with_dn(dn, map)?;
        self.add_entry(&entry)
    }

    /// Updates an entry from its map projection. A non-blank `dn` overrides the map's DN.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidInput`] when no DN is available, otherwise as
    /// [`Connection::update_entry`].
    fn update_entry_from_map(&mut self, dn: Option<&str>, map: EntryMap) -> Result<()> {
        let entry = Entry::from_map_with_dn(dn, map)?;
        self.update_entry(&entry)
    }

    /// Adds one value to an attribute.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn add_attribute_value(&mut self, dn: &str, name: &str, value: AttributeValue) -> Result<()> {
        self.add_attribute(dn, &Attribute::single(name, value))
    }

    /// Replaces an attribute with a single value.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn update_attribute_value(
        &mut self,
        dn: &str,
        name: &str,
        value: AttributeValue,
    ) -> Result<()> {
        self.update_attribute(dn, &Attribute::single(name, value))
    }

    /// Deletes one value of an attribute, or the whole attribute when `value` is `None`.
    ///
    /// # Errors
    ///
    /// Returns a translated error on failure.
    fn delete_attribute_value(
        &mut self,
        dn: &str,
        name: &str,
        value: Option<AttributeValue>,
    ) -> Result<()> {
        let attribute = match value {
            Some(value) => Attribute::single(name, value),
            None => Attribute::empty(name),
        };
        self.delete_attribute(dn, &attribute)
    }
}

fn read_first(cursor: &mut dyn ResultCursor, base_dn: &str, filter: &str) -> Result<Option<Entry>> {
    if !cursor.has_next()? {
        return Ok(None);
    }
    let first = cursor.next_entry()?;
    if cursor.has_next()? {
        warn!(
            base_dn,
            filter,
            dn = %first.dn(),
            "search matched more than one entry, returning the first"
        );
    }
    Ok(Some(first))
}
