//! Substring search over the canonical string forms of a registry's records.
//!
//! Only the current schema is consulted: a value whose column has been
//! removed is never rendered and so can never match.

use tracing::debug;

use crate::construct::{Database, Record, Registry, RegistryId};
use crate::datatype::Rendering;
use crate::error::Result;

/// True if any of the record's current cells contains `needle`, which must
/// already be lowercased.
pub fn matches(record: &Record, registry: &Registry, rendering: &Rendering, needle: &str) -> bool {
    record
        .project(registry)
        .filter_map(|(_, value)| value)
        .any(|value| rendering.render(value).to_lowercase().contains(needle))
}

/// Records of the registry matching `query`, in creation order. An empty
/// query matches everything.
pub fn search(database: &Database, registry_id: RegistryId, query: &str) -> Result<Vec<Record>> {
    let (registry, records) = database.snapshot(registry_id)?;
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(records);
    }
    let total = records.len();
    let found: Vec<Record> = records
        .into_iter()
        .filter(|record| matches(record, &registry, database.rendering(), &needle))
        .collect();
    debug!(registry = %registry_id, query = %needle, total, found = found.len(), "search complete");
    Ok(found)
}
