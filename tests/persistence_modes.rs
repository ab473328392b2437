use registrar::construct::{ColumnId, ColumnSpec, Database, PersistenceMode};
use registrar::datatype::{ColumnType, Value};
use serde_json::{json, Map, Value as Json};

fn data(pairs: &[(ColumnId, Json)]) -> Map<String, Json> {
    pairs.iter().map(|(c, v)| (c.to_string(), v.clone())).collect()
}

#[test]
fn in_memory_mode_allows_basic_operations() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = db
        .create_registry("Scratch", None, vec![ColumnSpec::new("A", ColumnType::Text)], "alice")
        .unwrap();
    db.create_record(registry.id, &Map::new()).unwrap();
    assert_eq!(db.list_records(registry.id).unwrap().len(), 1);
}

#[test]
fn file_mode_survives_a_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("registrar.db").to_string_lossy().to_string();

    let (registry, status, kept, dropped, note) = {
        let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
        let registry = db
            .create_registry(
                "Assets",
                Some("hardware"),
                vec![
                    ColumnSpec::new("No", ColumnType::Id),
                    ColumnSpec::new("Status", ColumnType::Select).with_options(&["Active", "Retired"]),
                    ColumnSpec::new("Bought", ColumnType::Date),
                ],
                "alice",
            )
            .unwrap();
        let status = registry.columns[1].id;
        let bought = registry.columns[2].id;
        let kept = db
            .create_record(registry.id, &data(&[(status, json!("Retired")), (bought, json!("2024-03-01"))]))
            .unwrap();
        let dropped = db.create_record(registry.id, &Map::new()).unwrap();
        db.delete_record(dropped.id).unwrap();
        db.update_options(registry.id, status, vec!["Active".into()]).unwrap();
        db.remove_column(registry.id, bought).unwrap();
        let note = db.add_column(registry.id, ColumnSpec::new("Note", ColumnType::Text)).unwrap();
        (db.registry(registry.id).unwrap(), status, kept, dropped, note)
    };

    let db = Database::new(PersistenceMode::File(path)).expect("reopened db");
    let restored = db.registry(registry.id).unwrap();
    assert_eq!(restored, registry);
    assert_eq!(restored.next_autonumber, 3);
    assert_eq!(restored.columns[2].id, note.id);
    assert_eq!(restored.column(status).unwrap().retired_options(), ["Retired".to_string()]);

    // the orphaned date is still there
    assert_eq!(db.record(kept.id).unwrap(), kept);
    assert!(db.record(dropped.id).is_err());

    // the counter carries on where it stopped
    let next = db.create_record(registry.id, &data(&[(status, json!("Retired"))])).unwrap();
    assert_eq!(next.value(registry.columns[0].id), Some(&Value::Id(3)));
}

#[test]
fn deleted_registries_stay_deleted() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("registrar.db").to_string_lossy().to_string();
    let id = {
        let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
        let registry = db
            .create_registry("Gone", None, vec![ColumnSpec::new("A", ColumnType::Text)], "alice")
            .unwrap();
        db.create_record(registry.id, &Map::new()).unwrap();
        db.delete_registry(registry.id).unwrap();
        registry.id
    };
    let db = Database::new(PersistenceMode::File(path)).expect("reopened db");
    assert!(db.registry(id).is_err());
    assert!(db.registries().unwrap().is_empty());
}

// Another connection holding an exclusive lock makes every write fail.
fn lock_file(path: &str) -> rusqlite::Connection {
    let other = rusqlite::Connection::open(path).expect("second connection");
    other.execute_batch("begin exclusive;").expect("exclusive lock");
    other
}

#[test]
fn failed_registry_delete_changes_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("registrar.db").to_string_lossy().to_string();
    let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
    let registry = db
        .create_registry("Assets", None, vec![ColumnSpec::new("A", ColumnType::Text)], "alice")
        .unwrap();
    db.create_record(registry.id, &Map::new()).unwrap();

    let other = lock_file(&path);
    assert!(db.delete_registry(registry.id).is_err());
    assert!(db.registry(registry.id).is_ok());
    assert_eq!(db.list_records(registry.id).unwrap().len(), 1);
    other.execute_batch("rollback;").unwrap();

    assert!(db.delete_registry(registry.id).unwrap());
    drop(db);
    let db = Database::new(PersistenceMode::File(path)).expect("reopened db");
    assert!(db.registry(registry.id).is_err());
}

#[test]
fn failed_record_write_gives_its_number_back() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("registrar.db").to_string_lossy().to_string();
    let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
    let registry = db
        .create_registry("Log", None, vec![ColumnSpec::new("No", ColumnType::Id)], "alice")
        .unwrap();

    let other = lock_file(&path);
    assert!(db.create_record(registry.id, &Map::new()).is_err());
    assert_eq!(db.registry(registry.id).unwrap().next_autonumber, 1);
    other.execute_batch("rollback;").unwrap();

    let record = db.create_record(registry.id, &Map::new()).unwrap();
    assert_eq!(record.value(registry.columns[0].id), Some(&Value::Id(1)));
}
