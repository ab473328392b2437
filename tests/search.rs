use registrar::construct::{ColumnId, ColumnSpec, Database, PersistenceMode, Registry};
use registrar::datatype::{CheckboxStyle, ColumnType, Rendering};
use registrar::search::search;
use serde_json::{json, Map, Value as Json};

fn data(pairs: &[(ColumnId, Json)]) -> Map<String, Json> {
    pairs.iter().map(|(c, v)| (c.to_string(), v.clone())).collect()
}

fn seeded(db: &Database) -> Registry {
    let registry = db
        .create_registry(
            "Assets",
            None,
            vec![
                ColumnSpec::new("No", ColumnType::Id),
                ColumnSpec::new("Name", ColumnType::Text),
                ColumnSpec::new("Bought", ColumnType::Date),
                ColumnSpec::new("Insured", ColumnType::Checkbox),
                ColumnSpec::new("Tags", ColumnType::Multiselect).with_options(&["db", "web"]),
            ],
            "alice",
        )
        .expect("registry");
    let c: Vec<ColumnId> = registry.columns.iter().map(|c| c.id).collect();
    db.create_record(
        registry.id,
        &data(&[
            (c[1], json!("Mail Server")),
            (c[2], json!("2024-03-01")),
            (c[3], json!(true)),
            (c[4], json!(["web", "db"])),
        ]),
    )
    .unwrap();
    db.create_record(registry.id, &data(&[(c[1], json!("Printer")), (c[3], json!(false))]))
        .unwrap();
    registry
}

fn hits(db: &Database, registry: &Registry, query: &str) -> usize {
    search(db, registry.id, query).expect("search").len()
}

#[test]
fn matches_are_case_insensitive_substrings() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = seeded(&db);
    assert_eq!(hits(&db, &registry, "SERVER"), 1);
    assert_eq!(hits(&db, &registry, "r"), 2);
    assert_eq!(hits(&db, &registry, "scanner"), 0);
}

#[test]
fn empty_query_returns_everything() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = seeded(&db);
    assert_eq!(hits(&db, &registry, ""), 2);
    assert_eq!(hits(&db, &registry, "   "), 2);
}

#[test]
fn rendered_forms_are_searched() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = seeded(&db);
    // dates, checkboxes, autonumbers and option lists as displayed
    assert_eq!(hits(&db, &registry, "01.03.2024"), 1);
    assert_eq!(hits(&db, &registry, "✗"), 1);
    assert_eq!(hits(&db, &registry, "2"), 2);
    assert_eq!(hits(&db, &registry, "web, db"), 1);
    assert_eq!(hits(&db, &registry, "2024-03-01"), 0);
}

#[test]
fn checkbox_words_are_searchable() {
    let rendering = Rendering {
        checkbox: CheckboxStyle::Words,
        ..Rendering::default()
    };
    let db = Database::with_rendering(PersistenceMode::InMemory, rendering).expect("db");
    let registry = seeded(&db);
    assert_eq!(hits(&db, &registry, "yes"), 1);
}

#[test]
fn removed_columns_do_not_match() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let registry = seeded(&db);
    db.remove_column(registry.id, registry.columns[1].id).unwrap();
    assert_eq!(hits(&db, &registry, "printer"), 0);
}
