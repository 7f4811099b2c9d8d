//! In-memory directory speaking the `LdapSession` protocol.
//!
//! Supports the filter subset the tests use (presence, equality, trailing wildcard, `&`, `|`,
//! `!`), the three scopes, size limits and RFC 2696 paging with offset cookies.

#![allow(dead_code)]

use dirconn_core::{ConnectionConfig, SearchScope};
use dirconn_ldap::{
    same_dn, DirectoryModification, Dn, LdapConnection, LdapSession, RawAttribute, RawEntry,
    SearchPage, SearchRequest, SessionConnector, SessionError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const URL: &str = "ldap://directory.test:389/dc=mulesoft,dc=org";
pub const SUFFIX: &str = "dc=mulesoft,dc=org";
pub const PEOPLE: &str = "ou=people,dc=mulesoft,dc=org";
pub const ADMIN_DN: &str = "cn=admin,dc=mulesoft,dc=org";
pub const ADMIN_PASSWORD: &str = "admin";
pub const USER1_DN: &str = "uid=user1,ou=people,dc=mulesoft,dc=org";
pub const USER1_PASSWORD: &str = "user1pass";

#[derive(Debug, Clone)]
struct StoredEntry {
    dn: String,
    attributes: Vec<(String, Vec<Vec<u8>>)>,
}

impl StoredEntry {
    fn values(&self, name: &str) -> Option<&Vec<Vec<u8>>> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    fn values_mut(&mut self, name: &str) -> Option<&mut Vec<Vec<u8>>> {
        self.attributes
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before != self.attributes.len()
    }
}

#[derive(Default)]
struct DirectoryState {
    entries: BTreeMap<String, StoredEntry>,
    connects: usize,
    unbinds: usize,
    searches: usize,
    unreachable: bool,
}

/// Shared in-memory directory tree.
#[derive(Clone, Default)]
pub struct FakeDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

fn key(dn: &str) -> String {
    Dn::parse(dn).map_or_else(|_| dn.to_ascii_lowercase(), |dn| dn.normalized())
}

fn parent_key(dn: &str) -> Option<String> {
    Dn::parse(dn)
        .ok()
        .and_then(|dn| dn.parent())
        .filter(|parent| !parent.is_root())
        .map(|parent| parent.normalized())
}

impl FakeDirectory {
    /// Directory holding the suffix, `ou=people`, the admin and `user1`.
    pub fn seeded() -> Self {
        let directory = Self::default();
        directory.insert(SUFFIX, &[("objectClass", &["top", "domain"]), ("dc", &["mulesoft"])]);
        directory.insert(
            PEOPLE,
            &[("objectClass", &["top", "organizationalUnit"]), ("ou", &["people"])],
        );
        directory.insert(
            ADMIN_DN,
            &[
                ("objectClass", &["top", "person"]),
                ("cn", &["admin"]),
                ("sn", &["admin"]),
                ("userPassword", &[ADMIN_PASSWORD]),
            ],
        );
        directory.insert(
            USER1_DN,
            &[
                ("objectClass", &["top", "person", "inetOrgPerson"]),
                ("uid", &["user1"]),
                ("cn", &["User One"]),
                ("sn", &["One"]),
                ("mail", &["user1@mulesoft.org", "user.one@mulesoft.org"]),
                ("telephoneNumber", &["555-0101"]),
                ("userPassword", &[USER1_PASSWORD]),
            ],
        );
        directory
    }

    /// Stores an entry without any parent checks.
    pub fn insert(&self, dn: &str, attributes: &[(&str, &[&str])]) {
        let entry = StoredEntry {
            dn: dn.to_string(),
            attributes: attributes
                .iter()
                .map(|(name, values)| {
                    (
                        (*name).to_string(),
                        values.iter().map(|value| value.as_bytes().to_vec()).collect(),
                    )
                })
                .collect(),
        };
        self.state.lock().entries.insert(key(dn), entry);
    }

    /// Adds `count` people `uid=personNN` under `ou=people`.
    pub fn add_people(&self, count: usize) {
        for index in 0..count {
            let uid = format!("person{index:02}");
            let dn = format!("uid={uid},{PEOPLE}");
            let cn = format!("Person {index}");
            self.insert(
                &dn,
                &[
                    ("objectClass", &["top", "person"]),
                    ("uid", &[uid.as_str()]),
                    ("cn", &[cn.as_str()]),
                    ("sn", &["Person"]),
                ],
            );
        }
    }

    pub fn contains(&self, dn: &str) -> bool {
        self.state.lock().entries.contains_key(&key(dn))
    }

    /// Text values of an attribute as stored.
    pub fn text_values(&self, dn: &str, attribute: &str) -> Option<Vec<String>> {
        let state = self.state.lock();
        state.entries.get(&key(dn)).and_then(|entry| {
            entry.values(attribute).map(|values| {
                values
                    .iter()
                    .map(|value| String::from_utf8_lossy(value).into_owned())
                    .collect()
            })
        })
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Sessions connected and not yet unbound.
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock();
        state.connects - state.unbinds
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Search round trips served, page requests included.
    pub fn searches(&self) -> usize {
        self.state.lock().searches
    }

    pub fn connector(&self) -> Arc<dyn SessionConnector> {
        Arc::new(FakeConnector {
            directory: self.clone(),
        })
    }

    /// Unbound connection to this directory.
    pub fn connection(&self, config: ConnectionConfig) -> LdapConnection {
        LdapConnection::with_connector(config, self.connector()).unwrap()
    }

    fn matched_ancestor(state: &DirectoryState, dn: &str) -> String {
        let mut current = Dn::parse(dn).ok().and_then(|dn| dn.parent());
        while let Some(candidate) = current {
            if candidate.is_root() {
                break;
            }
            if let Some(entry) = state.entries.get(&candidate.normalized()) {
                return entry.dn.clone();
            }
            current = candidate.parent();
        }
        String::new()
    }

    fn no_such_object(state: &DirectoryState, dn: &str) -> SessionError {
        SessionError::result(32, Self::matched_ancestor(state, dn), "no such object")
    }
}

struct FakeConnector {
    directory: FakeDirectory,
}

impl SessionConnector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn LdapSession>, SessionError> {
        let mut state = self.directory.state.lock();
        if state.unreachable {
            return Err(SessionError::transport("connection refused"));
        }
        state.connects += 1;
        Ok(Box::new(FakeSession {
            directory: self.directory.clone(),
        }))
    }
}

struct FakeSession {
    directory: FakeDirectory,
}

impl LdapSession for FakeSession {
    fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), SessionError> {
        let state = self.directory.state.lock();
        let accepted = state
            .entries
            .get(&key(dn))
            .and_then(|entry| entry.values("userPassword"))
            .is_some_and(|values| values.iter().any(|value| value == password.as_bytes()));
        if accepted {
            Ok(())
        } else {
            Err(SessionError::result(49, "", "invalid credentials"))
        }
    }

    fn search(&mut self, request: &SearchRequest) -> Result<SearchPage, SessionError> {
        let filter = parse_filter(&request.filter)
            .map(|(filter, _)| filter)
            .ok_or_else(|| SessionError::Protocol("invalid search filter".to_string()))?;
        let mut state = self.directory.state.lock();
        state.searches += 1;

        let base = key(&request.base);
        if !state.entries.contains_key(&base) {
            return Err(FakeDirectory::no_such_object(&state, &request.base));
        }
        let base_dn =
            Dn::parse(&request.base).map_err(|err| SessionError::Protocol(err.to_string()))?;

        let mut matches = state
            .entries
            .values()
            .filter(|entry| {
                let Ok(dn) = Dn::parse(&entry.dn) else {
                    return false;
                };
                match request.scope {
                    SearchScope::Object => dn == base_dn,
                    SearchScope::OneLevel => dn.parent().is_some_and(|parent| parent == base_dn),
                    SearchScope::SubTree => dn == base_dn || dn.is_descendant_of(&base_dn),
                }
            })
            .filter(|entry| filter.matches(entry))
            .map(|entry| project(entry, &request.attributes))
            .collect::<Vec<_>>();

        let mut truncated = false;
        let limit = request.size_limit as usize;
        if limit > 0 && matches.len() > limit {
            matches.truncate(limit);
            truncated = true;
        }

        let Some(page) = &request.page else {
            return Ok(SearchPage {
                entries: matches,
                truncated,
                ..SearchPage::default()
            });
        };
        if page.size == 0 {
            return Ok(SearchPage::default());
        }

        let offset = std::str::from_utf8(&page.cookie)
            .ok()
            .and_then(|cookie| cookie.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + page.size as usize).min(matches.len());
        let entries = matches.get(offset..end).map(<[RawEntry]>::to_vec).unwrap_or_default();
        let cookie = if end < matches.len() {
            end.to_string().into_bytes()
        } else {
            Vec::new()
        };
        Ok(SearchPage {
            entries,
            cookie: Some(cookie),
            truncated: truncated && end >= matches.len(),
            referrals: Vec::new(),
        })
    }

    fn add(&mut self, dn: &str, attributes: &[RawAttribute]) -> Result<(), SessionError> {
        let mut state = self.directory.state.lock();
        if state.entries.contains_key(&key(dn)) {
            return Err(SessionError::result(68, "", "entry already exists"));
        }
        if let Some(parent) = parent_key(dn) {
            if !state.entries.contains_key(&parent) {
                return Err(FakeDirectory::no_such_object(&state, dn));
            }
        }
        state.entries.insert(
            key(dn),
            StoredEntry {
                dn: dn.to_string(),
                attributes: attributes.to_vec(),
            },
        );
        Ok(())
    }

    fn modify(
        &mut self,
        dn: &str,
        modifications: &[DirectoryModification],
    ) -> Result<(), SessionError> {
        let mut state = self.directory.state.lock();
        let Some(mut entry) = state.entries.get(&key(dn)).cloned() else {
            return Err(FakeDirectory::no_such_object(&state, dn));
        };

        for modification in modifications {
            match modification {
                DirectoryModification::Add { attribute, values } => {
                    match entry.values_mut(attribute) {
                        Some(existing) => {
                            for value in values {
                                if existing.contains(value) {
                                    return Err(SessionError::result(
                                        20,
                                        "",
                                        "value already exists",
                                    ));
                                }
                                existing.push(value.clone());
                            }
                        }
                        None => entry.attributes.push((attribute.clone(), values.clone())),
                    }
                }
                DirectoryModification::Delete { attribute, values } if values.is_empty() => {
                    if !entry.remove(attribute) {
                        return Err(SessionError::result(16, "", "no such attribute"));
                    }
                }
                DirectoryModification::Delete { attribute, values } => {
                    let Some(existing) = entry.values_mut(attribute) else {
                        return Err(SessionError::result(16, "", "no such attribute"));
                    };
                    existing.retain(|value| !values.contains(value));
                    if existing.is_empty() {
                        entry.remove(attribute);
                    }
                }
                DirectoryModification::Replace { attribute, values } => {
                    entry.remove(attribute);
                    if !values.is_empty() {
                        entry.attributes.push((attribute.clone(), values.clone()));
                    }
                }
            }
        }
        state.entries.insert(key(dn), entry);
        Ok(())
    }

    fn delete(&mut self, dn: &str) -> Result<(), SessionError> {
        let mut state = self.directory.state.lock();
        let target = key(dn);
        if !state.entries.contains_key(&target) {
            return Err(FakeDirectory::no_such_object(&state, dn));
        }
        let has_children = state
            .entries
            .values()
            .any(|entry| parent_key(&entry.dn).as_deref() == Some(target.as_str()));
        if has_children {
            return Err(SessionError::result(66, "", "subordinate objects must be deleted first"));
        }
        state.entries.remove(&target);
        Ok(())
    }

    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<String>,
    ) -> Result<(), SessionError> {
        let mut state = self.directory.state.lock();
        let Some(mut entry) = state.entries.remove(&key(dn)) else {
            return Err(FakeDirectory::no_such_object(&state, dn));
        };
        let superior = new_superior.unwrap_or_else(|| {
            Dn::parse(dn)
                .ok()
                .and_then(|dn| dn.parent())
                .map(|parent| parent.to_string())
                .unwrap_or_default()
        });
        let new_dn = if superior.is_empty() {
            new_rdn.to_string()
        } else {
            format!("{new_rdn},{superior}")
        };
        if state.entries.contains_key(&key(&new_dn)) || same_dn(dn, &new_dn) {
            state.entries.insert(key(dn), entry);
            return Err(SessionError::result(68, "", "entry already exists"));
        }
        entry.dn = new_dn.clone();
        state.entries.insert(key(&new_dn), entry);
        Ok(())
    }

    fn unbind(&mut self) -> Result<(), SessionError> {
        self.directory.state.lock().unbinds += 1;
        Ok(())
    }
}

fn project(entry: &StoredEntry, requested: &[String]) -> RawEntry {
    let all = requested.is_empty() || requested.iter().any(|name| name == "*");
    let none = requested.iter().any(|name| name == "1.1");
    let mut attrs = HashMap::new();
    let mut bin_attrs = HashMap::new();

    for (name, values) in &entry.attributes {
        let wanted = !none
            && (all || requested.iter().any(|requested| requested.eq_ignore_ascii_case(name)));
        if !wanted {
            continue;
        }
        let text = values
            .iter()
            .map(|value| String::from_utf8(value.clone()))
            .collect::<Result<Vec<_>, _>>();
        match text {
            Ok(text) => {
                attrs.insert(name.clone(), text);
            }
            Err(_) => {
                bin_attrs.insert(name.clone(), values.clone());
            }
        }
    }

    RawEntry {
        dn: entry.dn.clone(),
        relative: false,
        attrs,
        bin_attrs,
    }
}

enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present(String),
    Equal(String, String),
    Prefix(String, String),
}

impl Filter {
    fn matches(&self, entry: &StoredEntry) -> bool {
        let text_values = |attribute: &str| {
            entry
                .values(attribute)
                .map(|values| {
                    values
                        .iter()
                        .map(|value| String::from_utf8_lossy(value).to_ascii_lowercase())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        match self {
            Self::And(filters) => filters.iter().all(|filter| filter.matches(entry)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(entry)),
            Self::Not(filter) => !filter.matches(entry),
            // Every entry has an object class.
            Self::Present(attribute) if attribute.eq_ignore_ascii_case("objectClass") => true,
            Self::Present(attribute) => entry.values(attribute).is_some(),
            Self::Equal(attribute, value) => text_values(attribute)
                .iter()
                .any(|candidate| candidate == &value.to_ascii_lowercase()),
            Self::Prefix(attribute, prefix) => text_values(attribute)
                .iter()
                .any(|candidate| candidate.starts_with(&prefix.to_ascii_lowercase())),
        }
    }
}

fn parse_filter(input: &str) -> Option<(Filter, &str)> {
    let input = input.trim_start().strip_prefix('(')?;
    let (filter, rest) = match input.chars().next()? {
        '&' => {
            let (filters, rest) = parse_list(&input[1..])?;
            (Filter::And(filters), rest)
        }
        '|' => {
            let (filters, rest) = parse_list(&input[1..])?;
            (Filter::Or(filters), rest)
        }
        '!' => {
            let (filter, rest) = parse_filter(&input[1..])?;
            (Filter::Not(Box::new(filter)), rest)
        }
        _ => {
            let end = input.find(')')?;
            let (attribute, value) = input[..end].split_once('=')?;
            let attribute = attribute.trim().to_string();
            let filter = if value == "*" {
                Filter::Present(attribute)
            } else if let Some(prefix) = value.strip_suffix('*') {
                Filter::Prefix(attribute, prefix.to_string())
            } else {
                Filter::Equal(attribute, value.to_string())
            };
            (filter, &input[end..])
        }
    };
    let rest = rest.strip_prefix(')')?;
    Some((filter, rest))
}

fn parse_list(mut input: &str) -> Option<(Vec<Filter>, &str)> {
    let mut filters = Vec::new();
    while input.trim_start().starts_with('(') {
        let (filter, rest) = parse_filter(input)?;
        filters.push(filter);
        input = rest;
    }
    Some((filters, input))
}

/// Default configuration pointing at the fake directory.
pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(URL).unwrap()
}
