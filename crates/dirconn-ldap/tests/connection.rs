mod common;

use common::{
    config, FakeDirectory, ADMIN_DN, ADMIN_PASSWORD, PEOPLE, SUFFIX, USER1_DN, USER1_PASSWORD,
};
use dirconn_core::{
    Attribute, AttributeValue, AuthenticationMode, BindFailure, Connection, ConnectionRegistry,
    Credentials, Entry, EntryMap, ErrorKind, MapValue, SearchControls, SearchScope, MAP_DN_KEY,
};
use dirconn_ldap::{LdapConnection, PoolSettings, SessionPool};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

fn admin(directory: &FakeDirectory) -> LdapConnection {
    let mut connection = directory.connection(config());
    connection
        .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
        .unwrap();
    connection
}

fn subtree() -> SearchControls {
    SearchControls::builder().scope(SearchScope::SubTree).build()
}

fn dns(entries: &[Entry]) -> BTreeSet<String> {
    entries.iter().map(|entry| entry.dn().to_ascii_lowercase()).collect()
}

#[test]
fn bind_with_correct_password() {
    let directory = FakeDirectory::seeded();
    let mut connection = directory.connection(config());

    connection
        .bind(Credentials::simple(USER1_DN, USER1_PASSWORD))
        .unwrap();
    assert_eq!(connection.bound_user_dn().as_deref(), Some(USER1_DN));

    let entry = connection.bound_entry(None).unwrap().unwrap();
    assert_eq!(entry.dn(), USER1_DN);
}

#[test]
fn bind_with_wrong_password() {
    let directory = FakeDirectory::seeded();
    let mut connection = directory.connection(config());

    let err = connection
        .bind(Credentials::simple(USER1_DN, "wrong"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    assert_eq!(err.bind_failure(), BindFailure::IncorrectCredentials);
    assert!(connection.is_closed());
    assert_eq!(directory.open_sessions(), 0);
}

#[test]
fn bind_to_unreachable_server() {
    let directory = FakeDirectory::seeded();
    directory.set_unreachable(true);
    let mut connection = directory.connection(config());

    let err = connection
        .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommunicationFailure);
    assert_eq!(err.bind_failure(), BindFailure::CannotReach);
}

#[test]
fn anonymous_bind_has_no_bound_entry() {
    let directory = FakeDirectory::seeded();
    let mut connection =
        directory.connection(config().with_authentication(AuthenticationMode::None));

    connection
        .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
        .unwrap();
    assert!(connection.bound_user_dn().is_none());
    assert!(connection.bound_entry(None).unwrap().is_none());

    // Anonymous reads still work.
    assert!(connection.exists(USER1_DN).unwrap());
}

#[test]
fn anonymous_sentinel_principal() {
    let directory = FakeDirectory::seeded();
    let mut connection = directory.connection(config());

    connection
        .bind(Credentials::simple("ANONYMOUS", ""))
        .unwrap();
    assert!(connection.bound_user_dn().is_none());
}

#[test]
fn rebinding_releases_previous_session() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    connection
        .bind(Credentials::simple(USER1_DN, USER1_PASSWORD))
        .unwrap();
    assert_eq!(directory.open_sessions(), 1);
    assert_eq!(connection.bound_user_dn().as_deref(), Some(USER1_DN));

    connection.close().unwrap();
    assert_eq!(directory.open_sessions(), 0);
}

#[test]
fn map_round_trip_through_directory() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let mut map = EntryMap::new();
    map.insert(
        MAP_DN_KEY.to_string(),
        MapValue::from("uid=jdoe,ou=people,dc=mulesoft,dc=org"),
    );
    map.insert("objectClass".to_string(), MapValue::from(vec!["top", "person"]));
    map.insert("uid".to_string(), MapValue::from("jdoe"));
    map.insert("cn".to_string(), MapValue::from("John Doe"));
    map.insert("sn".to_string(), MapValue::from("Doe"));

    let original = Entry::from_map(map.clone()).unwrap();
    assert!(Entry::from_map(original.to_map()).unwrap().equivalent(&original));

    connection.add_entry_from_map(None, map).unwrap();
    let stored = connection
        .lookup("uid=jdoe,ou=people,dc=mulesoft,dc=org", None)
        .unwrap();
    assert!(stored.equivalent(&original));
    assert!(stored.attribute("objectClass").unwrap().is_multi_valued());
    assert!(!stored.attribute("cn").unwrap().is_multi_valued());
}

#[test]
fn map_without_dn_is_rejected() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let mut map = EntryMap::new();
    map.insert("cn".to_string(), MapValue::from("nobody"));
    let err = connection.update_entry_from_map(Some("  "), map).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn add_existing_entry() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let entry = Entry::new(USER1_DN).with_attribute(Attribute::single("uid", "user1"));
    let err = connection.add_entry(&entry).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameAlreadyBound);
}

#[test]
fn paged_search_matches_plain_search() {
    let directory = FakeDirectory::seeded();
    directory.add_people(23);
    let mut connection = admin(&directory);

    let plain = connection
        .search_all(PEOPLE, "(objectClass=person)", &subtree())
        .unwrap();

    let before = directory.searches();
    let paged_controls = SearchControls::builder()
        .scope(SearchScope::SubTree)
        .page_size(5)
        .build();
    let paged = connection
        .search_all(PEOPLE, "(objectClass=person)", &paged_controls)
        .unwrap();

    assert_eq!(plain.len(), 24);
    assert_eq!(dns(&plain), dns(&paged));
    assert_eq!(directory.searches() - before, 5);
    assert_eq!(directory.open_sessions(), 1);
}

#[test]
fn has_next_does_not_consume_entries() {
    let directory = FakeDirectory::seeded();
    directory.add_people(4);
    let mut connection = admin(&directory);

    let controls = SearchControls::builder()
        .scope(SearchScope::OneLevel)
        .page_size(2)
        .build();
    let mut cursor = connection.search(PEOPLE, "(uid=person*)", &controls).unwrap();

    let mut seen = Vec::new();
    loop {
        let first = cursor.has_next().unwrap();
        let second = cursor.has_next().unwrap();
        assert_eq!(first, second);
        if !first {
            break;
        }
        seen.push(cursor.next_entry().unwrap());
    }
    assert_eq!(seen.len(), 4);
    assert_eq!(
        cursor.next_entry().unwrap_err().kind(),
        ErrorKind::EndOfResults
    );
    cursor.close().unwrap();
}

#[test]
fn closing_paged_cursor_early_releases_session() {
    let directory = FakeDirectory::seeded();
    directory.add_people(10);
    let mut connection = admin(&directory);

    let controls = SearchControls::builder()
        .scope(SearchScope::OneLevel)
        .page_size(3)
        .build();
    let mut cursor = connection.search(PEOPLE, "(uid=person*)", &controls).unwrap();
    assert_eq!(directory.open_sessions(), 2);

    cursor.next_entry().unwrap();
    cursor.close().unwrap();
    assert_eq!(directory.open_sessions(), 1);
    assert!(!cursor.has_next().unwrap());
}

#[test]
fn size_limit_is_normal_exhaustion() {
    let directory = FakeDirectory::seeded();
    directory.add_people(12);
    let mut connection = admin(&directory);

    let controls = SearchControls::builder()
        .scope(SearchScope::OneLevel)
        .max_results(5)
        .build();
    let entries = connection
        .search_all(PEOPLE, "(uid=person*)", &controls)
        .unwrap();
    assert_eq!(entries.len(), 5);
}

#[test]
fn cursor_helpers_group_and_skip() {
    let directory = FakeDirectory::seeded();
    directory.add_people(7);
    let mut connection = admin(&directory);

    let controls = SearchControls::builder()
        .scope(SearchScope::OneLevel)
        .page_size(2)
        .build();
    let mut cursor = connection.search(PEOPLE, "(uid=person*)", &controls).unwrap();
    assert_eq!(cursor.skip_entries(2).unwrap(), 2);
    let pages = cursor.pages(2).unwrap();
    assert_eq!(
        pages.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
    cursor.close().unwrap();
}

#[test]
fn requested_attributes_only() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let controls = SearchControls::builder()
        .scope(SearchScope::OneLevel)
        .attributes(["mail", "MAIL", " "])
        .build();
    let entry = connection
        .search_one(PEOPLE, "(uid=user1)", &controls)
        .unwrap()
        .unwrap();
    assert_eq!(entry.attribute_count(), 1);
    assert_eq!(entry.attribute("mail").unwrap().values().len(), 2);
}

#[test]
fn search_one_returns_first_match() {
    let directory = FakeDirectory::seeded();
    directory.add_people(3);
    let mut connection = admin(&directory);

    let first = connection
        .search_one(PEOPLE, "(sn=Person)", &subtree())
        .unwrap();
    assert!(first.is_some());
    let none = connection
        .search_one(PEOPLE, "(&(sn=Person)(!(uid=person*)))", &subtree())
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn search_below_missing_base() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let err = connection
        .search("ou=nowhere,dc=mulesoft,dc=org", "(objectClass=*)", &subtree())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NameNotFound);
}

#[test]
fn delete_semantics() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    // Missing leaf under an existing parent.
    connection
        .delete_entry("uid=ghost,ou=people,dc=mulesoft,dc=org")
        .unwrap();

    let err = connection
        .delete_entry("uid=ghost,ou=nowhere,dc=mulesoft,dc=org")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameNotFound);

    let err = connection.delete_entry(PEOPLE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextNotEmpty);

    let user = connection.lookup(USER1_DN, None).unwrap();
    connection.delete(&user).unwrap();
    assert!(!directory.contains(USER1_DN));
    connection.delete_entry(USER1_DN).unwrap();
}

#[test]
fn partial_update_leaves_other_attributes() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let update = Entry::new(USER1_DN).with_attribute(Attribute::single("cn", "User Uno"));
    connection.update_entry(&update).unwrap();

    let entry = connection.lookup(USER1_DN, None).unwrap();
    assert_eq!(
        entry.attribute("cn").unwrap().value(),
        Some(&AttributeValue::from("User Uno"))
    );
    assert_eq!(entry.attribute("mail").unwrap().values().len(), 2);
    assert_eq!(
        entry.attribute("telephoneNumber").unwrap().value(),
        Some(&AttributeValue::from("555-0101"))
    );
}

#[test]
fn delete_whole_attribute() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    connection
        .delete_attribute_value(USER1_DN, "mail", None)
        .unwrap();
    let entry = connection.lookup(USER1_DN, None).unwrap();
    assert!(entry.attribute("mail").is_none());
}

#[test]
fn delete_single_value_keeps_the_rest() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    connection
        .delete_attribute_value(
            USER1_DN,
            "mail",
            Some(AttributeValue::from("user1@mulesoft.org")),
        )
        .unwrap();
    assert_eq!(
        directory.text_values(USER1_DN, "mail"),
        Some(vec!["user.one@mulesoft.org".to_string()])
    );
}

#[test]
fn attribute_edits() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    connection
        .add_attribute(USER1_DN, &Attribute::multi("description", ["first", "second"]))
        .unwrap();
    connection
        .add_attribute_value(USER1_DN, "mail", AttributeValue::from("third@mulesoft.org"))
        .unwrap();
    connection
        .update_attribute_value(USER1_DN, "sn", AttributeValue::from("Uno"))
        .unwrap();

    let entry = connection.lookup(USER1_DN, None).unwrap();
    assert_eq!(entry.attribute("description").unwrap().values().len(), 2);
    assert_eq!(entry.attribute("mail").unwrap().values().len(), 3);
    assert_eq!(
        entry.attribute("sn").unwrap().value(),
        Some(&AttributeValue::from("Uno"))
    );

    let err = connection
        .add_attribute_value(USER1_DN, "mail", AttributeValue::from("third@mulesoft.org"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAttribute);
}

#[test]
fn binary_values_survive() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let photo = vec![0xff, 0xd8, 0xff, 0xe0];
    connection
        .add_attribute_value(USER1_DN, "jpegPhoto", AttributeValue::from(photo.clone()))
        .unwrap();
    let entry = connection
        .lookup(USER1_DN, Some(&["jpegPhoto".to_string()]))
        .unwrap();
    let value = entry.attribute("jpegPhoto").unwrap().value().unwrap();
    assert!(value.is_binary());
    assert_eq!(value.as_bytes(), photo.as_slice());
    assert!(entry.to_ldif().contains("jpegPhoto:: "));
}

#[test]
fn rename_and_move() {
    let directory = FakeDirectory::seeded();
    directory.insert(
        "ou=staff,dc=mulesoft,dc=org",
        &[("objectClass", &["organizationalUnit"]), ("ou", &["staff"])],
    );
    let mut connection = admin(&directory);

    connection
        .rename_entry(USER1_DN, "uid=user1-renamed,ou=people,dc=mulesoft,dc=org")
        .unwrap();
    assert!(directory.contains("uid=user1-renamed,ou=people,dc=mulesoft,dc=org"));

    connection
        .rename_entry(
            "uid=user1-renamed,ou=people,dc=mulesoft,dc=org",
            "uid=user1-renamed,ou=staff,dc=mulesoft,dc=org",
        )
        .unwrap();
    assert!(directory.contains("uid=user1-renamed,ou=staff,dc=mulesoft,dc=org"));
    assert!(!directory.contains(USER1_DN));

    let err = connection
        .rename_entry(ADMIN_DN, "uid=user1-renamed,ou=staff,dc=mulesoft,dc=org")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameAlreadyBound);
}

#[test]
fn cursor_outliving_its_session_fails() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let mut cursor = connection
        .search(SUFFIX, "(objectClass=*)", &subtree())
        .unwrap();
    connection
        .bind(Credentials::simple(USER1_DN, USER1_PASSWORD))
        .unwrap();
    assert_eq!(
        cursor.has_next().unwrap_err().kind(),
        ErrorKind::CommunicationFailure
    );
}

#[test]
fn pooled_sessions_are_reused() {
    let directory = FakeDirectory::seeded();
    let pool = Arc::new(SessionPool::new(
        PoolSettings {
            initial_size: 1,
            max_size: 2,
            idle_timeout: None,
            checkout_timeout: Duration::from_millis(50),
        },
        directory.connector(),
    ));

    for _ in 0..3 {
        let mut connection = LdapConnection::with_pool(config(), pool.clone()).unwrap();
        connection
            .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
            .unwrap();
        assert!(connection.exists(USER1_DN).unwrap());
        connection.close().unwrap();
    }
    assert_eq!(directory.connects(), 1);
}

#[test]
fn pooling_from_configuration() {
    let directory = FakeDirectory::seeded();
    let mut connection = directory.connection(config().with_pool_size(2, 4));

    connection
        .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
        .unwrap();
    assert_eq!(directory.connects(), 2);
    connection
        .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
        .unwrap();
    assert_eq!(directory.connects(), 2);

    connection.close().unwrap();
    let err = connection
        .bind(Credentials::simple(ADMIN_DN, "not-the-password"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    assert_eq!(err.bind_failure(), BindFailure::IncorrectCredentials);
    assert!(connection.is_closed());

    connection
        .bind(Credentials::simple(ADMIN_DN, ADMIN_PASSWORD))
        .unwrap();
    assert_eq!(connection.bound_user_dn().as_deref(), Some(ADMIN_DN));
}

#[test]
fn registry_with_injected_backend() {
    let directory = FakeDirectory::seeded();
    let connector = directory.connector();
    let mut registry = ConnectionRegistry::new();
    registry.register("fake", move |config| {
        LdapConnection::with_connector(config, connector.clone())
            .map(|connection| Box::new(connection) as Box<dyn Connection>)
    });

    let properties = HashMap::from([
        ("type".to_string(), "fake".to_string()),
        ("url".to_string(), common::URL.to_string()),
        ("referral".to_string(), "throw".to_string()),
    ]);
    let mut connection = registry.create(&properties).unwrap();
    connection
        .bind(Credentials::simple(USER1_DN, USER1_PASSWORD))
        .unwrap();
    assert!(connection.exists(USER1_DN).unwrap());

    let err = registry
        .create(&HashMap::from([("type".to_string(), "missing".to_string())]))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn entry_json_round_trip() {
    let directory = FakeDirectory::seeded();
    let mut connection = admin(&directory);

    let entry = connection.lookup(USER1_DN, None).unwrap();
    let json = serde_json::to_string(&entry).unwrap();
    let parsed: Entry = serde_json::from_str(&json).unwrap();
    assert!(parsed.equivalent(&entry));
}
