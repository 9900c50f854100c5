//! Metadata store against a real SQLite file: sealed preferences, credential
//! rotation and expiry, and the append-only audit log.

use statlake_core::{Clock, DatasetCategory, DatasetId, DatasetStatus, ManualClock};
use statlake_store::metadata::{
    Actor, AuditFilter, CredentialCheck, DatasetRegistration, FieldCipher, MetadataOptions,
    MetadataStore, NewCredential, Page, PreferenceValue,
};
use statlake_store::StoreError;
use std::sync::Arc;
use std::time::Duration;

// ── Fixtures ─────────────────────────────────────────────────────────

struct Fixture {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
    store: MetadataStore,
    clock: Arc<ManualClock>,
}

fn fixture(master_key: Option<&str>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.sqlite");
    let clock = Arc::new(ManualClock::new());
    let store = MetadataStore::open(&MetadataOptions::new(&path), FieldCipher::new(master_key), clock.clone()).unwrap();
    Fixture {
        _dir: dir,
        path,
        store,
        clock,
    }
}

fn raw(path: &std::path::Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).unwrap()
}

fn audit_count(store: &MetadataStore) -> usize {
    store.query_audit(&AuditFilter::default()).unwrap().len()
}

// ── Preferences ──────────────────────────────────────────────────────

#[test]
fn sealed_preference_never_hits_disk_in_clear() {
    let f = fixture(Some("prefs-master-key"));
    let actor = Actor::new("alice");
    let token = PreferenceValue::Text("sk-live-4f9a2c".into());

    f.store
        .set_user_preference("alice", "upstream_token", &token, true, &actor)
        .unwrap();

    let stored: String = raw(&f.path)
        .query_row(
            "SELECT value FROM user_preferences WHERE user_id = 'alice' AND preference_key = 'upstream_token'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(stored.starts_with("enc:v1:"), "{stored}");
    assert!(!stored.contains("sk-live-4f9a2c"));

    let listed = f.store.get_user_preferences("alice").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].value, PreferenceValue::Sealed);
    assert!(listed[0].encrypted);

    assert_eq!(
        f.store.reveal_user_preference("alice", "upstream_token").unwrap(),
        Some(token)
    );

    // The audit entry records the type, never the value.
    let entries = f.store.query_audit(&AuditFilter::for_record("user_preferences", "alice/upstream_token")).unwrap();
    assert_eq!(entries.len(), 1);
    let details = entries[0].details.as_deref().unwrap();
    assert!(!details.contains("sk-live"));
}

#[test]
fn plain_preferences_round_trip_and_upsert() {
    let f = fixture(None);
    let actor = Actor::new("bob");
    let layout = PreferenceValue::Json(serde_json::json!({ "columns": ["territory", "value"], "rows": 50 }));

    f.store.set_user_preference("bob", "layout", &layout, false, &actor).unwrap();
    f.store
        .set_user_preference("bob", "dark_mode", &PreferenceValue::Bool(false), false, &actor)
        .unwrap();
    f.store
        .set_user_preference("bob", "dark_mode", &PreferenceValue::Bool(true), false, &actor)
        .unwrap();

    let prefs = f.store.get_user_preferences("bob").unwrap();
    let keys: Vec<_> = prefs.iter().map(|p| p.preference_key.as_str()).collect();
    assert_eq!(keys, ["dark_mode", "layout"]);
    assert_eq!(prefs[0].value, PreferenceValue::Bool(true));
    assert_eq!(prefs[1].value, layout);
    assert!(f.store.get_user_preferences("nobody").unwrap().is_empty());
    assert_eq!(f.store.reveal_user_preference("bob", "missing").unwrap(), None);
}

#[test]
fn sealing_without_master_key_fails_cleanly() {
    let f = fixture(None);
    let err = f
        .store
        .set_user_preference("carol", "token", &PreferenceValue::Text("x".into()), true, &Actor::new("carol"))
        .unwrap_err();
    assert!(matches!(err, StoreError::Crypto(_)));
    assert!(f.store.get_user_preferences("carol").unwrap().is_empty());
    assert_eq!(audit_count(&f.store), 0);
}

#[test]
fn sealed_value_is_bound_to_its_row() {
    let f = fixture(Some("prefs-master-key"));
    let actor = Actor::new("dave");
    f.store
        .set_user_preference("dave", "a", &PreferenceValue::Text("secret-a".into()), true, &actor)
        .unwrap();
    f.store
        .set_user_preference("dave", "b", &PreferenceValue::Text("secret-b".into()), true, &actor)
        .unwrap();

    // Swap the ciphertexts behind the store's back.
    raw(&f.path)
        .execute_batch(
            "UPDATE user_preferences SET value = (SELECT value FROM user_preferences WHERE preference_key = 'b')
             WHERE preference_key = 'a';",
        )
        .unwrap();
    assert!(matches!(
        f.store.reveal_user_preference("dave", "a"),
        Err(StoreError::Crypto(_))
    ));
}

// ── Credentials ──────────────────────────────────────────────────────

fn credential(secret: &str) -> NewCredential {
    NewCredential {
        service_name: "istat-sdmx".into(),
        secret: secret.into(),
        scopes: vec!["read".into()],
        expires_at: None,
    }
}

#[test]
fn rotation_revokes_the_previous_secret() {
    let f = fixture(Some("cred-master-key"));
    let actor = Actor::new("ops");

    let first = f.store.store_credential(&credential("first-secret"), &actor).unwrap();
    assert!(f.store.validate_credential("istat-sdmx", "first-secret").unwrap().is_valid());

    f.clock.advance(Duration::from_secs(5));
    let second = f.store.store_credential(&credential("second-secret"), &actor).unwrap();
    assert_ne!(first.id, second.id);

    assert_eq!(
        f.store.validate_credential("istat-sdmx", "first-secret").unwrap(),
        CredentialCheck::Invalid
    );
    match f.store.validate_credential("istat-sdmx", "second-secret").unwrap() {
        CredentialCheck::Valid(c) => {
            assert_eq!(c.id, second.id);
            assert_eq!(c.scopes, ["read"]);
            assert!(c.revoked_at.is_none());
        }
        other => panic!("expected a valid credential, got {other:?}"),
    }
    assert_eq!(
        f.store.validate_credential("istat-sdmx", "wrong").unwrap(),
        CredentialCheck::Invalid
    );

    let ops: Vec<_> = f
        .store
        .query_audit(&AuditFilter::for_record("api_credentials", "istat-sdmx"))
        .unwrap()
        .into_iter()
        .map(|e| e.operation)
        .collect();
    assert_eq!(ops, ["create", "rotate"]);

    // Only the hash is persisted.
    let hashes: Vec<String> = {
        let conn = raw(&f.path);
        let mut stmt = conn.prepare("SELECT secret_hash FROM api_credentials").unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.collect::<rusqlite::Result<_>>().unwrap()
    };
    assert_eq!(hashes.len(), 2);
    assert!(hashes.iter().all(|h| !h.contains("secret")));
}

#[test]
fn credentials_expire_on_the_clock() {
    let f = fixture(Some("cred-master-key"));
    let mut cred = credential("short-lived");
    cred.expires_at = Some(f.clock.wall() + chrono::Duration::hours(1));
    f.store.store_credential(&cred, &Actor::new("ops")).unwrap();

    assert!(f.store.validate_credential("istat-sdmx", "short-lived").unwrap().is_valid());
    f.clock.advance(Duration::from_secs(2 * 3600));
    assert_eq!(
        f.store.validate_credential("istat-sdmx", "short-lived").unwrap(),
        CredentialCheck::Expired
    );
}

// ── Registry and audit ───────────────────────────────────────────────

#[test]
fn every_governed_write_is_audited_once() {
    let f = fixture(Some("audit-master-key"));
    let actor = Actor::new("loader");
    let reg = DatasetRegistration::new(DatasetId::parse("ECO_GDP").unwrap(), "GDP", "istat");

    f.store.register_dataset(&reg, &actor).unwrap();
    assert_eq!(audit_count(&f.store), 1);
    f.store.mark_dataset_active("ECO_GDP", 42, &actor).unwrap();
    assert_eq!(audit_count(&f.store), 2);
    f.store
        .set_user_preference("loader", "lang", &PreferenceValue::Text("it".into()), false, &actor)
        .unwrap();
    assert_eq!(audit_count(&f.store), 3);
    f.store.store_credential(&credential("s1"), &actor).unwrap();
    assert_eq!(audit_count(&f.store), 4);

    let entry = f.store.get_dataset("ECO_GDP").unwrap().unwrap();
    assert_eq!(entry.category, DatasetCategory::Economy);
    assert_eq!((entry.status, entry.row_count), (DatasetStatus::Active, 42));

    let by_loader = f
        .store
        .query_audit(&AuditFilter {
            user_id: Some("loader".into()),
            operation: Some("activate".into()),
            ..AuditFilter::default()
        })
        .unwrap();
    assert_eq!(by_loader.len(), 1);
    assert_eq!(by_loader[0].record_id, "ECO_GDP");
}

#[test]
fn missing_dataset_status_change_is_not_found() {
    let f = fixture(None);
    let err = f
        .store
        .mark_dataset_invalid("NOPE_1", "gone", &Actor::system())
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert_eq!(audit_count(&f.store), 0);
}

#[test]
fn audit_log_rejects_updates_and_deletes() {
    let f = fixture(None);
    f.store
        .append_audit("export", "dataset_registry", "POP_1", &Actor::new("eve"), Some("{\"rows\":3}"))
        .unwrap();

    let conn = raw(&f.path);
    assert!(conn.execute("UPDATE audit_log SET user_id = 'mallory'", []).is_err());
    assert!(conn.execute("DELETE FROM audit_log", []).is_err());
    assert_eq!(audit_count(&f.store), 1);
    assert_eq!(f.store.query_audit(&AuditFilter::default()).unwrap()[0].user_id, "eve");
}

#[test]
fn audit_filters_by_time_window_and_limit() {
    let f = fixture(None);
    let actor = Actor::new("svc");
    let start = f.clock.wall();
    for i in 0..5 {
        f.store
            .append_audit("touch", "dataset_registry", &format!("DS_{i}"), &actor, None)
            .unwrap();
        f.clock.advance(Duration::from_secs(60));
    }

    let window = f
        .store
        .query_audit(&AuditFilter {
            since: Some(start + chrono::Duration::seconds(60)),
            until: Some(start + chrono::Duration::seconds(180)),
            ..AuditFilter::default()
        })
        .unwrap();
    let ids: Vec<_> = window.iter().map(|e| e.record_id.as_str()).collect();
    assert_eq!(ids, ["DS_1", "DS_2", "DS_3"]);

    let limited = f
        .store
        .query_audit(&AuditFilter {
            limit: Some(2),
            ..AuditFilter::default()
        })
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn schema_is_migrated_and_idempotent() -> anyhow::Result<()> {
    let f = fixture(None);
    assert_eq!(f.store.schema_version()?, 2);
    drop(f.store);

    let reopened = MetadataStore::open(
        &MetadataOptions::new(&f.path),
        FieldCipher::new(None),
        Arc::new(ManualClock::new()),
    )?;
    assert_eq!(reopened.schema_version()?, 2);
    assert!(reopened.list_by_category(None, Page::default())?.is_empty());
    Ok(())
}
