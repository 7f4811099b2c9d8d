//! Request controls not provided by `ldap3`.

use dirconn_core::SortKey;
use ldap3::asn1::{write, ASNTag, Boolean, OctetString, Sequence, Tag, TagClass};
use ldap3::controls::RawControl;
use std::io;

/// OID of the RFC 2891 server-side sort request control.
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";

const ORDERING_RULE_ID: u64 = 0;
const REVERSE_ORDER_ID: u64 = 1;

/// Builds a non-critical sort request control for a single key.
///
/// ```text
/// SortKeyList ::= SEQUENCE OF SEQUENCE {
///     attributeType   AttributeDescription,
///     orderingRule    [0] MatchingRuleId OPTIONAL,
///     reverseOrder    [1] BOOLEAN DEFAULT FALSE }
/// ```
///
/// # Errors
///
/// Returns the BER encoder's failure.
pub fn sort_request_control(key: &SortKey) -> io::Result<RawControl> {
    let mut sort_key = vec![Tag::OctetString(OctetString {
        inner: key.attribute.as_bytes().to_vec(),
        ..Default::default()
    })];
    if let Some(rule) = &key.ordering_rule {
        sort_key.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: ORDERING_RULE_ID,
            inner: rule.as_bytes().to_vec(),
        }));
    }
    // DEFAULT FALSE is omitted.
    if key.reverse {
        sort_key.push(Tag::Boolean(Boolean {
            class: TagClass::Context,
            id: REVERSE_ORDER_ID,
            inner: true,
        }));
    }

    let key_list = Tag::Sequence(Sequence {
        inner: vec![Tag::Sequence(Sequence {
            inner: sort_key,
            ..Default::default()
        })],
        ..Default::default()
    })
    .into_structure();

    let mut value = bytes::BytesMut::new();
    write::encode_into(&mut value, key_list)?;
    Ok(RawControl {
        ctype: SORT_REQUEST_OID.to_string(),
        crit: false,
        val: Some(value.to_vec()),
    })
}
