use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use registrar::construct::{ColumnId, ColumnSpec, Database, PersistenceMode, Registry};
use registrar::datatype::{ColumnType, Value};
use serde_json::Map;

fn numbered(db: &Database) -> Registry {
    db.create_registry(
        "Log",
        None,
        vec![
            ColumnSpec::new("No", ColumnType::Id),
            ColumnSpec::new("Ref", ColumnType::Id),
            ColumnSpec::new("Note", ColumnType::Text),
        ],
        "alice",
    )
    .expect("registry")
}

fn numbers(db: &Database, registry: &Registry, column: ColumnId) -> Vec<i64> {
    let mut numbers: Vec<i64> = db
        .list_records(registry.id)
        .unwrap()
        .iter()
        .filter_map(|r| match r.value(column) {
            Some(Value::Id(n)) => Some(*n),
            _ => None,
        })
        .collect();
    numbers.sort_unstable();
    numbers
}

#[test]
fn numbers_are_sequential_from_one() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = numbered(&db);
    for _ in 0..5 {
        db.create_record(registry.id, &Map::new()).unwrap();
    }
    assert_eq!(numbers(&db, &registry, registry.columns[0].id), vec![1, 2, 3, 4, 5]);
    assert_eq!(db.registry(registry.id).unwrap().next_autonumber, 6);
}

#[test]
fn id_columns_share_one_sequence() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = numbered(&db);
    let record = db.create_record(registry.id, &Map::new()).unwrap();
    assert_eq!(record.value(registry.columns[0].id), Some(&Value::Id(1)));
    assert_eq!(record.value(registry.columns[1].id), Some(&Value::Id(1)));
}

#[test]
fn deleted_numbers_are_not_reused() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = numbered(&db);
    let first = db.create_record(registry.id, &Map::new()).unwrap();
    db.create_record(registry.id, &Map::new()).unwrap();
    db.delete_record(first.id).unwrap();
    let third = db.create_record(registry.id, &Map::new()).unwrap();
    assert_eq!(third.value(registry.columns[0].id), Some(&Value::Id(3)));
}

#[test]
fn registries_count_independently() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let a = numbered(&db);
    let b = numbered(&db);
    db.create_record(a.id, &Map::new()).unwrap();
    db.create_record(a.id, &Map::new()).unwrap();
    let first_of_b = db.create_record(b.id, &Map::new()).unwrap();
    assert_eq!(first_of_b.value(b.columns[0].id), Some(&Value::Id(1)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn concurrent_writers_get_unique_gap_free_numbers(writers in 2usize..6, per_writer in 1usize..20) {
        let db = Arc::new(Database::new(PersistenceMode::InMemory).expect("db"));
        let registry = numbered(&db);
        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let db = Arc::clone(&db);
                let id = registry.id;
                thread::spawn(move || {
                    for _ in 0..per_writer {
                        db.create_record(id, &Map::new()).expect("record");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer");
        }
        let total = (writers * per_writer) as i64;
        let expected: Vec<i64> = (1..=total).collect();
        prop_assert_eq!(numbers(&db, &registry, registry.columns[0].id), expected);
        prop_assert_eq!(db.registry(registry.id).unwrap().next_autonumber, total + 1);
    }
}
