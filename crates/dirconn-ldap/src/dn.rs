//! Distinguished name parsing and comparison.
//!
//! Directory servers report DNs with whatever spacing and case the entry was created with, so
//! comparisons go through [`Dn::normalized`], which lowercases attribute types and values and
//! drops insignificant whitespace.

use dirconn_core::Error;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a distinguished name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnError {
    /// A component was not of the form `type=value`.
    #[error("invalid distinguished name component: {0}")]
    InvalidComponent(String),
    /// A component had nothing left of the `=`.
    #[error("distinguished name component missing attribute: {0}")]
    MissingAttribute(String),
    /// The DN ended in the middle of an escape sequence.
    #[error("distinguished name contains an unterminated escape sequence")]
    UnterminatedEscape,
    /// A `\XX` escape was not valid hex or did not decode to UTF-8.
    #[error("distinguished name contains an invalid hex escape")]
    InvalidHexEscape,
}

impl From<DnError> for Error {
    fn from(err: DnError) -> Self {
        Error::invalid_input(err.to_string())
    }
}

/// One `type=value` assertion of an RDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ava {
    attribute: String,
    value: String,
}

impl Ava {
    /// Creates an assertion.
    #[must_use]
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Attribute type, e.g. `uid`.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Unescaped value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Relative distinguished name; usually one assertion, several when `+`-joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    /// Single-assertion RDN.
    #[must_use]
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            avas: vec![Ava::new(attribute, value)],
        }
    }

    /// Assertions in order.
    #[must_use]
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// Value of the assertion on `attribute`, ignoring case.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.avas
            .iter()
            .find(|ava| ava.attribute.eq_ignore_ascii_case(attribute))
            .map(Ava::value)
    }

    fn normalized(&self) -> String {
        let mut parts: Vec<String> = self
            .avas
            .iter()
            .map(|ava| {
                format!(
                    "{}={}",
                    ava.attribute.to_ascii_lowercase(),
                    escape(&ava.value.to_lowercase())
                )
            })
            .collect();
        parts.sort_unstable();
        parts.join("+")
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .avas
            .iter()
            .map(|ava| format!("{}={}", ava.attribute, escape(&ava.value)))
            .collect::<Vec<_>>()
            .join("+");
        f.write_str(&rendered)
    }
}

/// Parsed distinguished name. The empty DN is the root of the tree.
#[derive(Debug, Clone, Default)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// Parses a DN. Blank input yields the root DN.
    ///
    /// # Errors
    ///
    /// Returns [`DnError`] for malformed components or escapes.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, DnError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let mut rdns = Vec::new();
        for component in split_escaped(raw, &[',', ';'])? {
            let mut avas = Vec::new();
            for part in split_escaped(&component, &['+'])? {
                avas.push(split_attribute_value(&part)?);
            }
            rdns.push(Rdn { avas });
        }
        Ok(Self { rdns })
    }

    /// Returns true for the root DN.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Leftmost RDN, `None` for the root.
    #[must_use]
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// DN of the parent entry, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Self {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// Appends `suffix`, e.g. a relative name joined with its search base.
    #[must_use]
    pub fn join(mut self, suffix: &Self) -> Self {
        self.rdns.extend(suffix.rdns.iter().cloned());
        self
    }

    /// Prepends an RDN.
    #[must_use]
    pub fn child(mut self, rdn: Rdn) -> Self {
        self.rdns.insert(0, rdn);
        self
    }

    /// Case- and whitespace-insensitive form used for comparisons.
    #[must_use]
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns true if `self` lies strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        self.rdns.len() > ancestor.rdns.len()
            && self.rdns[self.rdns.len() - ancestor.rdns.len()..]
                .iter()
                .zip(&ancestor.rdns)
                .all(|(left, right)| left.normalized() == right.normalized())
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Dn {}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .rdns
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&rendered)
    }
}

impl FromStr for Dn {
    type Err = DnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Compares two DN strings, falling back to a case-insensitive string comparison when either
/// does not parse.
#[must_use]
pub fn same_dn(left: &str, right: &str) -> bool {
    match (Dn::parse(left), Dn::parse(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => left.trim().eq_ignore_ascii_case(right.trim()),
    }
}

/// Splits on unescaped delimiters, keeping escape sequences intact for the value parser.
fn split_escaped(input: &str, delimiters: &[char]) -> Result<Vec<String>, DnError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escape = false;

    for ch in input.chars() {
        if escape {
            current.push(ch);
            escape = false;
        } else if ch == '\\' {
            current.push(ch);
            escape = true;
        } else if delimiters.contains(&ch) {
            parts.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }

    if escape {
        return Err(DnError::UnterminatedEscape);
    }
    parts.push(current.trim().to_string());
    if parts.iter().any(String::is_empty) {
        return Err(DnError::InvalidComponent(input.to_string()));
    }
    Ok(parts)
}

fn split_attribute_value(component: &str) -> Result<Ava, DnError> {
    let (attribute, value) = component
        .split_once('=')
        .ok_or_else(|| DnError::InvalidComponent(component.to_string()))?;
    let attribute = attribute.trim();
    if attribute.is_empty() {
        return Err(DnError::MissingAttribute(component.to_string()));
    }
    Ok(Ava::new(attribute, unescape(value.trim())?))
}

fn unescape(value: &str) -> Result<String, DnError> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0_u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let next = chars.next().ok_or(DnError::UnterminatedEscape)?;
        if next.is_ascii_hexdigit() && chars.peek().is_some_and(char::is_ascii_hexdigit) {
            let low = chars.next().ok_or(DnError::UnterminatedEscape)?;
            let pair: String = [next, low].iter().collect();
            let byte = u8::from_str_radix(&pair, 16).map_err(|_| DnError::InvalidHexEscape)?;
            bytes.push(byte);
        } else {
            let mut buf = [0_u8; 4];
            bytes.extend_from_slice(next.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(bytes).map_err(|_| DnError::InvalidHexEscape)
}

fn escape(value: &str) -> String {
    let count = value.chars().count();
    let mut escaped = String::with_capacity(value.len());

    for (idx, ch) in value.chars().enumerate() {
        let needs_escape = matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (idx == 0 && (ch == ' ' || ch == '#'))
            || (idx + 1 == count && ch == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(ch);
    }

    escaped
}
