//! LDIF (RFC 2849) projection of entries.

use crate::entry::{Attribute, AttributeValue, Entry};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

impl Entry {
    /// Renders the entry as an LDIF record: a `dn:` line, one line per attribute value, and a
    /// terminating blank line.
    #[must_use]
    pub fn to_ldif(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, "dn", &AttributeValue::Text(self.dn().to_string()));
        for attribute in self.attributes() {
            attribute.write_ldif(&mut out);
        }
        out.push('\n');
        out
    }
}

impl Attribute {
    /// Renders the attribute as LDIF lines, one per value.
    #[must_use]
    pub fn to_ldif(&self) -> String {
        let mut out = String::new();
        self.write_ldif(&mut out);
        out
    }

    fn write_ldif(&self, out: &mut String) {
        for value in self.values() {
            push_line(out, self.name(), value);
        }
    }
}

/// Renders several entries as one LDIF document.
#[must_use]
pub fn to_ldif<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> String {
    entries.into_iter().map(Entry::to_ldif).collect()
}

fn push_line(out: &mut String, name: &str, value: &AttributeValue) {
    out.push_str(name);
    match value {
        AttributeValue::Text(text) if is_safe_string(text) => {
            out.push_str(": ");
            out.push_str(text);
        }
        other => {
            out.push_str(":: ");
            STANDARD.encode_string(other.as_bytes(), out);
        }
    }
    out.push('\n');
}

/// Text that can be written as-is; anything else is base64 encoded.
fn is_safe_string(text: &str) -> bool {
    if text.starts_with([' ', ':', '<']) || text.ends_with(' ') {
        return false;
    }
    !text.contains(['\n', '\r', '\0'])
}
