//! Registrar – dynamic registries with user-defined schemas.
//!
//! A *registry* is a table whose shape is decided at runtime: the user names
//! its columns, picks a type for each and, for the choice types, the list of
//! allowed options. Records are then validated against whatever the schema
//! looks like at the moment they are written, and always read back through
//! the current schema.
//!
//! ## Modules
//! * [`datatype`] – column types, the closed [`datatype::Value`] union,
//!   coercion of raw JSON input and canonical rendering.
//! * [`construct`] – registries, columns and records, the keepers that own
//!   them, and the [`construct::Database`] tying keepers to persistence.
//! * [`persist`] – SQLite persistence & restoration layer.
//! * [`search`] – substring search over rendered record values.
//! * [`export`] – CSV export of a registry.
//! * [`server`] – the REST surface (axum).
//! * [`settings`] – layered configuration (file + environment).
//! * [`error`] – the crate error type.
//!
//! ## Autonumbers
//! Every registry carries one counter shared by all of its `id` columns. A
//! value is claimed only after the rest of the record validated, and the new
//! counter is written in the same transaction as the record, so numbers are
//! unique and never reused under concurrent writers. A write that fails to
//! persist gives its number back.
//!
//! ## Quick Start
//! ```
//! use registrar::construct::{ColumnSpec, Database, PersistenceMode};
//! use registrar::datatype::ColumnType;
//! use serde_json::json;
//!
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let registry = db
//!     .create_registry(
//!         "Assets",
//!         None,
//!         vec![
//!             ColumnSpec::new("No", ColumnType::Id),
//!             ColumnSpec::new("Name", ColumnType::Text),
//!         ],
//!         "alice",
//!     )
//!     .unwrap();
//! let name = registry.columns[1].id.to_string();
//! let data = json!({ name: "Server1" });
//! let record = db.create_record(registry.id, data.as_object().unwrap()).unwrap();
//! assert_eq!(record.value(registry.columns[0].id).map(|v| v.to_json()), Some(json!(1)));
//! ```

pub mod construct;
pub mod datatype;
pub mod error;
pub mod export;
pub mod persist;
pub mod search;
pub mod server;
pub mod settings;
