use std::sync::{Arc, Mutex};

// other keepers use HashMap keyed by opaque identities
use core::hash::{BuildHasher, BuildHasherDefault};
use seahash::SeaHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

// used to print out readable forms of a construct
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as Json};
use tracing::{debug, info, warn};
use uuid::Uuid;

// our own stuff that we need
use crate::datatype::{ColumnType, Rendering, Value};
use crate::error::{Kind, RegistrarError, Result, Violation};
use crate::persist::Persistor;

pub type KeeperHasher = BuildHasherDefault<SeaHasher>;

// ------------- Identities -------------
// Identities are generated once and never derived from anything a user can
// change, so renames never move data around.
macro_rules! identity {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

identity!(RegistryId);
identity!(ColumnId);
identity!(RecordId);

// ------------- Column -------------
/// What a caller sends to describe a column. `id` only matters when a whole
/// schema is resubmitted: it ties the entry to an existing column.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            column_type,
            options: None,
        }
    }
    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.options = Some(options.iter().map(|o| o.to_string()).collect());
        self
    }
    pub fn with_id(mut self, id: ColumnId) -> Self {
        self.id = Some(id.to_string());
        self
    }
    fn options(&self) -> Vec<String> {
        self.options.clone().unwrap_or_default()
    }
    /// Everything about the spec that can be checked without a schema.
    fn violations(&self, field: &str) -> Vec<Violation> {
        let mut violations = Vec::new();
        if self.name.trim().is_empty() {
            violations.push(Violation::field(field, "column name must not be blank"));
        }
        let options = self.options();
        if !self.column_type.has_options() && !options.is_empty() {
            violations.push(Violation::field(
                field,
                format!("{} columns do not take options", self.column_type),
            ));
        }
        violations.extend(option_violations(field, &options));
        violations
    }
}

fn option_violations(field: &str, options: &[String]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut seen = HashSet::new();
    for option in options {
        if option.trim().is_empty() {
            violations.push(Violation::field(field, "options must not be blank"));
        } else if !seen.insert(option.as_str()) {
            violations.push(Violation::field(field, format!("duplicate option '{option}'")));
        }
    }
    violations
}

fn name_violation(field: &str, name: &str) -> Option<Violation> {
    name.trim()
        .is_empty()
        .then(|| Violation::field(field, "name must not be blank"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: ColumnId,
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub order: usize,
    // options that were valid once, kept so that stored values stay writable
    #[serde(skip)]
    retired: Vec<String>,
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType, options: Vec<String>) -> Self {
        Self::restore(ColumnId::generate(), name.trim().to_string(), column_type, options, 0, Vec::new())
    }
    pub fn restore(
        id: ColumnId,
        name: String,
        column_type: ColumnType,
        options: Vec<String>,
        order: usize,
        retired: Vec<String>,
    ) -> Self {
        Self {
            id,
            name,
            column_type,
            options,
            order,
            retired,
        }
    }
    fn from_spec(spec: &ColumnSpec, order: usize) -> Self {
        let mut column = Self::new(&spec.name, spec.column_type, spec.options());
        column.order = order;
        column
    }
    pub fn retired_options(&self) -> &[String] {
        &self.retired
    }
    pub fn accepts_option(&self, option: &str) -> bool {
        self.options.iter().chain(self.retired.iter()).any(|o| o == option)
    }
    pub fn retire_options(&mut self, options: &[String]) {
        for option in options {
            if !self.options.contains(option) && !self.retired.contains(option) {
                self.retired.push(option.clone());
            }
        }
    }
    /// Replaces the option list. Dropped options are retired rather than
    /// forgotten; re-added ones come back from retirement.
    pub fn set_options(&mut self, options: Vec<String>) {
        let dropped: Vec<String> = self
            .options
            .iter()
            .filter(|o| !options.contains(o))
            .cloned()
            .collect();
        self.options = options;
        self.retired.retain(|o| !self.options.contains(o));
        self.retire_options(&dropped);
    }
}

// ------------- Registry -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub id: RegistryId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub next_autonumber: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner: String,
}

fn described(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

impl Registry {
    pub const FIRST_AUTONUMBER: i64 = 1;

    pub fn column(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }
    fn column_mut(&mut self, id: ColumnId) -> Result<&mut ColumnDef> {
        self.columns
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RegistrarError::not_found(Kind::Column, id))
    }
    pub fn has_column_named(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        self.columns.iter().any(|c| c.name.to_lowercase() == name)
    }
    fn renumber(&mut self) {
        for (order, column) in self.columns.iter_mut().enumerate() {
            column.order = order;
        }
    }
    /// Hands out the next number of the registry's sequence.
    pub fn claim_autonumber(&mut self) -> i64 {
        let number = self.next_autonumber;
        self.next_autonumber += 1;
        number
    }
    /// Replaces the column list with a resubmitted one, matching entries to
    /// existing columns by id. Returns how many columns were dropped.
    fn resubmit(&mut self, specs: &[ColumnSpec]) -> Result<usize> {
        let mut violations = Vec::new();
        if specs.is_empty() {
            violations.push(Violation::field("columns", "a registry needs at least one column"));
        }
        let mut matched = HashSet::new();
        let mut names = HashSet::new();
        let mut columns = Vec::with_capacity(specs.len());
        for (order, spec) in specs.iter().enumerate() {
            let field = format!("columns[{order}]");
            violations.extend(spec.violations(&field));
            let lowered = spec.name.trim().to_lowercase();
            let existing = spec
                .id
                .as_deref()
                .and_then(|i| i.parse::<ColumnId>().ok())
                .and_then(|i| self.column(i));
            match existing {
                Some(existing) => {
                    if !matched.insert(existing.id) {
                        violations.push(Violation::column(existing.id, "column listed twice"));
                        continue;
                    }
                    if existing.column_type != spec.column_type {
                        violations.push(Violation::column(
                            existing.id,
                            format!(
                                "column type is fixed at {}; remove the column and add a new one instead",
                                existing.column_type
                            ),
                        ));
                        continue;
                    }
                    if !lowered.is_empty() && !names.insert(lowered) {
                        violations.push(Violation::column(
                            existing.id,
                            format!("duplicate column name '{}'", spec.name.trim()),
                        ));
                        continue;
                    }
                    let mut column = existing.clone();
                    column.name = spec.name.trim().to_string();
                    if column.column_type.has_options() {
                        column.set_options(spec.options());
                    }
                    columns.push(column);
                }
                None => {
                    let clashes = specs
                        .iter()
                        .enumerate()
                        .any(|(other, s)| other != order && s.name.trim().to_lowercase() == lowered);
                    if clashes || names.contains(&lowered) {
                        violations.push(Violation::field(
                            field,
                            format!("duplicate column name '{}'", spec.name.trim()),
                        ));
                        continue;
                    }
                    names.insert(lowered);
                    columns.push(ColumnDef::from_spec(spec, order));
                }
            }
        }
        if !violations.is_empty() {
            return Err(RegistrarError::invalid(violations));
        }
        let removed = self.columns.iter().filter(|c| !matched.contains(&c.id)).count();
        self.columns = columns;
        Ok(removed)
    }
    /// Validates caller input against the current schema.
    ///
    /// Every offending column is reported, not just the first. Keys that name
    /// no current column are refused, unless `previous` shows them to be
    /// orphaned values of the record being rewritten.
    pub fn admit(&self, data: &Map<String, Json>, previous: Option<&Data>) -> Result<Data> {
        let mut admitted = Data::new();
        let mut violations = Vec::new();
        for (key, raw) in data {
            let column = key.parse::<ColumnId>().ok().and_then(|id| self.column(id));
            match column {
                Some(column) => match ColumnType::coerce(column, raw) {
                    Ok(Some(value)) => {
                        admitted.insert(column.id, value);
                    }
                    Ok(None) => {}
                    Err(reason) => violations.push(Violation::column(column.id, reason)),
                },
                None => {
                    let orphaned = key
                        .parse::<ColumnId>()
                        .ok()
                        .is_some_and(|id| previous.is_some_and(|p| p.contains_key(&id)));
                    if !orphaned {
                        violations.push(Violation::field(key.as_str(), "unknown column"));
                    }
                }
            }
        }
        if violations.is_empty() {
            Ok(admitted)
        } else {
            Err(RegistrarError::invalid(violations))
        }
    }
}

// ------------- Record -------------
pub type Data = BTreeMap<ColumnId, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: RecordId,
    pub registry_id: RegistryId,
    #[serde(serialize_with = "plain_data")]
    pub data: Data,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn plain_data<S: Serializer>(data: &Data, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(data.len()))?;
    for (column, value) in data {
        map.serialize_entry(column, &value.to_json())?;
    }
    map.end()
}

impl Record {
    pub fn value(&self, column: ColumnId) -> Option<&Value> {
        self.data.get(&column)
    }
    /// The record seen through the current schema: one cell per column, in
    /// column order. Orphaned values do not show up.
    pub fn project<'a>(
        &'a self,
        registry: &'a Registry,
    ) -> impl Iterator<Item = (&'a ColumnDef, Option<&'a Value>)> + 'a {
        registry.columns.iter().map(move |c| (c, self.data.get(&c.id)))
    }
    pub fn orphaned<'a>(&'a self, registry: &'a Registry) -> impl Iterator<Item = (&'a ColumnId, &'a Value)> + 'a {
        self.data.iter().filter(move |(id, _)| registry.column(**id).is_none())
    }
}

// ------------- Keepers -------------
#[derive(Debug)]
pub struct RegistryKeeper {
    kept: HashMap<RegistryId, Arc<Mutex<Registry>>, KeeperHasher>,
    // creation order
    sequence: Vec<RegistryId>,
}
impl RegistryKeeper {
    pub fn new() -> Self {
        Self {
            kept: HashMap::default(),
            sequence: Vec::new(),
        }
    }
    pub fn keep(&mut self, registry: Registry) -> Arc<Mutex<Registry>> {
        let id = registry.id;
        let kept = Arc::new(Mutex::new(registry));
        if self.kept.insert(id, Arc::clone(&kept)).is_none() {
            self.sequence.push(id);
        }
        kept
    }
    pub fn get(&self, id: &RegistryId) -> Option<Arc<Mutex<Registry>>> {
        self.kept.get(id).map(Arc::clone)
    }
    /// True if `registry` is still the one kept under `id`.
    pub fn holds(&self, id: &RegistryId, registry: &Arc<Mutex<Registry>>) -> bool {
        self.kept.get(id).is_some_and(|k| Arc::ptr_eq(k, registry))
    }
    pub fn remove(&mut self, id: &RegistryId) -> Option<Arc<Mutex<Registry>>> {
        self.sequence.retain(|s| s != id);
        self.kept.remove(id)
    }
    pub fn all(&self) -> Vec<Arc<Mutex<Registry>>> {
        self.sequence
            .iter()
            .filter_map(|id| self.kept.get(id).map(Arc::clone))
            .collect()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

#[derive(Debug)]
pub struct RecordKeeper {
    kept: HashMap<RecordId, Record, KeeperHasher>,
    registry_to_record_lookup: Lookup<RegistryId, RecordId, KeeperHasher>,
}
impl RecordKeeper {
    pub fn new() -> Self {
        Self {
            kept: HashMap::default(),
            registry_to_record_lookup: Lookup::new(),
        }
    }
    pub fn keep(&mut self, record: Record) {
        if !self.kept.contains_key(&record.id) {
            self.registry_to_record_lookup.insert(record.registry_id, record.id);
        }
        self.kept.insert(record.id, record);
    }
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.kept.get(id)
    }
    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        let removed = self.kept.remove(id)?;
        self.registry_to_record_lookup.remove(&removed.registry_id, id);
        Some(removed)
    }
    pub fn records_of(&self, registry: &RegistryId) -> Vec<Record> {
        self.registry_to_record_lookup
            .lookup(registry)
            .iter()
            .filter_map(|id| self.kept.get(id).cloned())
            .collect()
    }
    /// Forgets every record of a registry, returning how many there were.
    pub fn purge(&mut self, registry: &RegistryId) -> usize {
        let ids = self.registry_to_record_lookup.take(registry);
        for id in &ids {
            self.kept.remove(id);
        }
        ids.len()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

// ------------- Lookups -------------
// Values keep the order in which they were inserted.
#[derive(Debug)]
pub struct Lookup<K, V, H> {
    index: HashMap<K, Vec<V>, H>,
}
impl<K: Eq + Hash, V: Eq, H: BuildHasher + Default> Lookup<K, V, H> {
    pub fn new() -> Self {
        Self {
            index: HashMap::<K, Vec<V>, H>::default(),
        }
    }
    pub fn insert(&mut self, key: K, value: V) {
        self.index.entry(key).or_default().push(value);
    }
    pub fn remove(&mut self, key: &K, value: &V) {
        if let Some(values) = self.index.get_mut(key) {
            values.retain(|v| v != value);
        }
    }
    pub fn lookup(&self, key: &K) -> &[V] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
    pub fn take(&mut self, key: &K) -> Vec<V> {
        self.index.remove(key).unwrap_or_default()
    }
}

// ------------- Database -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

// This sets up the database with the necessary structures.
//
// Locks are always taken in the order keeper, registry, record keeper,
// persistor, and the keeper lock is never held while waiting for a registry.
pub struct Database {
    pub registry_keeper: Arc<Mutex<RegistryKeeper>>,
    pub record_keeper: Arc<Mutex<RecordKeeper>>,
    // responsible for the the persistence layer
    pub persistor: Arc<Mutex<Persistor>>,
    rendering: Rendering,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        Self::with_rendering(mode, Rendering::default())
    }
    pub fn with_rendering(mode: PersistenceMode, rendering: Rendering) -> Result<Self> {
        rendering.check().map_err(RegistrarError::Config)?;
        let mut persistor = Persistor::open(&mode)?;
        let mut registry_keeper = RegistryKeeper::new();
        let mut record_keeper = RecordKeeper::new();

        // Restore the existing database
        for registry in persistor.restore_registries()? {
            registry_keeper.keep(registry);
        }
        for record in persistor.restore_records()? {
            record_keeper.keep(record);
        }
        info!(
            ?mode,
            registries = registry_keeper.len(),
            records = record_keeper.len(),
            "database ready"
        );

        Ok(Self {
            registry_keeper: Arc::new(Mutex::new(registry_keeper)),
            record_keeper: Arc::new(Mutex::new(record_keeper)),
            persistor: Arc::new(Mutex::new(persistor)),
            rendering,
        })
    }
    pub fn rendering(&self) -> &Rendering {
        &self.rendering
    }

    // Runs `work` inside the registry's mutual-exclusion section.
    fn with_registry<T>(&self, id: RegistryId, work: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let kept = self
            .registry_keeper
            .lock()?
            .get(&id)
            .ok_or_else(|| RegistrarError::not_found(Kind::Registry, id))?;
        let mut registry = kept.lock()?;
        // it may have been deleted while we waited
        if !self.registry_keeper.lock()?.holds(&id, &kept) {
            return Err(RegistrarError::not_found(Kind::Registry, id));
        }
        work(&mut *registry)
    }

    // Applies a schema change to a copy, persists it, then makes it current.
    // Hands back the committed registry next to the outcome.
    fn change_schema<T>(
        &self,
        id: RegistryId,
        change: impl FnOnce(&mut Registry) -> Result<T>,
    ) -> Result<(T, Registry)> {
        self.with_registry(id, |registry| {
            let mut changed = registry.clone();
            let outcome = change(&mut changed)?;
            changed.renumber();
            changed.updated_at = Utc::now();
            self.persistor.lock()?.persist_registry(&changed)?;
            *registry = changed;
            Ok((outcome, registry.clone()))
        })
    }

    // ------------- Schema Manager -------------
    pub fn create_registry(
        &self,
        name: &str,
        description: Option<&str>,
        columns: Vec<ColumnSpec>,
        owner: &str,
    ) -> Result<Registry> {
        let mut violations = Vec::new();
        violations.extend(name_violation("name", name));
        if columns.is_empty() {
            violations.push(Violation::field("columns", "a registry needs at least one column"));
        }
        let mut seen = HashSet::new();
        for (index, spec) in columns.iter().enumerate() {
            let field = format!("columns[{index}]");
            violations.extend(spec.violations(&field));
            if !spec.name.trim().is_empty() && !seen.insert(spec.name.trim().to_lowercase()) {
                violations.push(Violation::field(
                    field,
                    format!("duplicate column name '{}'", spec.name.trim()),
                ));
            }
        }
        if !violations.is_empty() {
            return Err(RegistrarError::invalid(violations));
        }
        let now = Utc::now();
        let registry = Registry {
            id: RegistryId::generate(),
            name: name.trim().to_string(),
            description: described(description),
            columns: columns
                .iter()
                .enumerate()
                .map(|(order, spec)| ColumnDef::from_spec(spec, order))
                .collect(),
            next_autonumber: Registry::FIRST_AUTONUMBER,
            created_at: now,
            updated_at: now,
            owner: owner.to_string(),
        };
        self.persistor.lock()?.persist_registry(&registry)?;
        self.registry_keeper.lock()?.keep(registry.clone());
        info!(registry = %registry.id, name = %registry.name, columns = registry.columns.len(), "registry created");
        Ok(registry)
    }
    pub fn registry(&self, id: RegistryId) -> Result<Registry> {
        self.with_registry(id, |registry| Ok(registry.clone()))
    }
    pub fn registries(&self) -> Result<Vec<Registry>> {
        let kept = self.registry_keeper.lock()?.all();
        let mut registries = Vec::with_capacity(kept.len());
        for registry in kept {
            registries.push(registry.lock()?.clone());
        }
        Ok(registries)
    }
    pub fn rename_registry(&self, id: RegistryId, name: &str, description: Option<&str>) -> Result<Registry> {
        if let Some(violation) = name_violation("name", name) {
            return Err(RegistrarError::invalid(vec![violation]));
        }
        let ((), registry) = self.change_schema(id, |registry| {
            registry.name = name.trim().to_string();
            registry.description = described(description);
            Ok(())
        })?;
        Ok(registry)
    }
    pub fn add_column(&self, id: RegistryId, spec: ColumnSpec) -> Result<ColumnDef> {
        let violations = spec.violations("column");
        if !violations.is_empty() {
            return Err(RegistrarError::invalid(violations));
        }
        let (column, _) = self.change_schema(id, |registry| {
            if registry.has_column_named(&spec.name) {
                return Err(RegistrarError::invalid(vec![Violation::field(
                    "name",
                    format!("duplicate column name '{}'", spec.name.trim()),
                )]));
            }
            let column = ColumnDef::from_spec(&spec, registry.columns.len());
            registry.columns.push(column.clone());
            Ok(column)
        })?;
        info!(registry = %id, column = %column.id, name = %column.name, column_type = %column.column_type, "column added");
        Ok(column)
    }
    pub fn rename_column(&self, id: RegistryId, column: ColumnId, name: &str) -> Result<ColumnDef> {
        if let Some(violation) = name_violation("name", name) {
            return Err(RegistrarError::invalid(vec![violation]));
        }
        let (renamed, _) = self.change_schema(id, |registry| {
            let target = registry.column_mut(column)?;
            target.name = name.trim().to_string();
            Ok(target.clone())
        })?;
        info!(registry = %id, column = %column, name = %renamed.name, "column renamed");
        Ok(renamed)
    }
    pub fn reorder_columns(&self, id: RegistryId, order: &[ColumnId]) -> Result<Registry> {
        let ((), registry) = self.change_schema(id, |registry| {
            let current: HashSet<ColumnId> = registry.columns.iter().map(|c| c.id).collect();
            let requested: HashSet<ColumnId> = order.iter().copied().collect();
            if order.len() != registry.columns.len() || requested != current {
                return Err(RegistrarError::invalid(vec![Violation::field(
                    "order",
                    "must list every column of the registry exactly once",
                )]));
            }
            let mut reordered = Vec::with_capacity(order.len());
            for column in order {
                reordered.push(registry.column_mut(*column)?.clone());
            }
            registry.columns = reordered;
            Ok(())
        })?;
        debug!(registry = %id, "columns reordered");
        Ok(registry)
    }
    /// Drops a column from the schema. Stored values under its id are kept
    /// but no longer reachable through the schema.
    pub fn remove_column(&self, id: RegistryId, column: ColumnId) -> Result<ColumnDef> {
        let (removed, _) = self.change_schema(id, |registry| {
            let position = registry
                .columns
                .iter()
                .position(|c| c.id == column)
                .ok_or_else(|| RegistrarError::not_found(Kind::Column, column))?;
            if registry.columns.len() == 1 {
                return Err(RegistrarError::invalid(vec![Violation::column(
                    column,
                    "a registry needs at least one column",
                )]));
            }
            Ok(registry.columns.remove(position))
        })?;
        info!(registry = %id, column = %column, name = %removed.name, "column removed");
        Ok(removed)
    }
    pub fn update_options(&self, id: RegistryId, column: ColumnId, options: Vec<String>) -> Result<ColumnDef> {
        let violations = option_violations("options", &options);
        if !violations.is_empty() {
            return Err(RegistrarError::invalid(violations));
        }
        let (updated, _) = self.change_schema(id, |registry| {
            let target = registry.column_mut(column)?;
            if !target.column_type.has_options() {
                return Err(RegistrarError::invalid(vec![Violation::column(
                    column,
                    format!("{} columns do not take options", target.column_type),
                )]));
            }
            target.set_options(options);
            Ok(target.clone())
        })?;
        info!(registry = %id, column = %column, options = updated.options.len(), "options updated");
        Ok(updated)
    }
    /// Brings the schema in line with a resubmitted column list in one step:
    /// entries naming an existing column id update that column, the others
    /// become new columns, and columns left out are removed.
    pub fn replace_schema(&self, id: RegistryId, specs: Vec<ColumnSpec>) -> Result<Registry> {
        self.update_registry(id, None, None, Some(specs))
    }
    /// Changes name, description and columns of a registry under one lock.
    /// Parts given as `None` stay as they are; nothing is applied if any part
    /// is refused.
    pub fn update_registry(
        &self,
        id: RegistryId,
        name: Option<&str>,
        description: Option<&str>,
        specs: Option<Vec<ColumnSpec>>,
    ) -> Result<Registry> {
        if let Some(violation) = name.and_then(|n| name_violation("name", n)) {
            return Err(RegistrarError::invalid(vec![violation]));
        }
        let ((), registry) = self.change_schema(id, |registry| {
            if let Some(specs) = &specs {
                let removed = registry.resubmit(specs)?;
                info!(registry = %id, columns = registry.columns.len(), removed, "schema replaced");
            }
            if let Some(name) = name {
                registry.name = name.trim().to_string();
            }
            if description.is_some() {
                registry.description = described(description);
            }
            Ok(())
        })?;
        Ok(registry)
    }
    /// Deletes a registry and every record in it. Unknown ids are a no-op.
    pub fn delete_registry(&self, id: RegistryId) -> Result<bool> {
        let kept = match self.registry_keeper.lock()?.get(&id) {
            Some(kept) => kept,
            None => return Ok(false),
        };
        // waits for in-flight writes on this registry to finish
        let _registry = kept.lock()?;
        if !self.registry_keeper.lock()?.holds(&id, &kept) {
            return Ok(false);
        }
        // memory is only touched once the rows are gone
        self.persistor.lock()?.delete_registry(&id)?;
        self.registry_keeper.lock()?.remove(&id);
        let purged = self.record_keeper.lock()?.purge(&id);
        info!(registry = %id, records = purged, "registry deleted");
        Ok(true)
    }

    // ------------- Record Store -------------
    pub fn create_record(&self, registry_id: RegistryId, data: &Map<String, Json>) -> Result<Record> {
        let record = self.with_registry(registry_id, |registry| {
            let mut admitted = registry.admit(data, None)?;
            let number = registry.claim_autonumber();
            for column in registry.columns.iter().filter(|c| c.column_type.is_autonumber()) {
                admitted.insert(column.id, Value::Id(number));
            }
            let now = Utc::now();
            let record = Record {
                id: RecordId::generate(),
                registry_id,
                data: admitted,
                created_at: now,
                updated_at: now,
            };
            // the number was never handed out if this fails
            let persisted = self
                .persistor
                .lock()
                .map_err(RegistrarError::from)
                .and_then(|mut persistor| persistor.persist_created_record(&record, registry.next_autonumber));
            if let Err(e) = persisted {
                registry.next_autonumber = number;
                return Err(e);
            }
            self.record_keeper.lock()?.keep(record.clone());
            debug!(registry = %registry_id, record = %record.id, autonumber = number, "record created");
            Ok(record)
        })?;
        Ok(record)
    }
    pub fn record(&self, id: RecordId) -> Result<Record> {
        self.record_keeper
            .lock()?
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistrarError::not_found(Kind::Record, id))
    }
    /// Replaces a record's data. Columns left out are cleared; autonumbers and
    /// orphaned values of removed columns are carried over.
    pub fn update_record(&self, id: RecordId, data: &Map<String, Json>) -> Result<Record> {
        let previous = self.record(id)?;
        self.with_registry(previous.registry_id, |registry| {
            // re-read under the registry lock, it may have changed meanwhile
            let previous = self.record(id)?;
            let mut replaced = registry.admit(data, Some(&previous.data))?;
            for (column, value) in &previous.data {
                let carried = match registry.column(*column) {
                    Some(c) => c.column_type.is_autonumber(),
                    None => true,
                };
                if carried {
                    replaced.insert(*column, value.clone());
                }
            }
            let record = Record {
                data: replaced,
                updated_at: Utc::now(),
                ..previous
            };
            self.persistor.lock()?.persist_updated_record(&record)?;
            self.record_keeper.lock()?.keep(record.clone());
            debug!(registry = %record.registry_id, record = %id, "record updated");
            Ok(record)
        })
    }
    /// Deletes a record for good. Deleting an unknown record is not an error.
    pub fn delete_record(&self, id: RecordId) -> Result<bool> {
        let registry_id = match self.record_keeper.lock()?.get(&id) {
            Some(record) => record.registry_id,
            None => {
                warn!(record = %id, "delete of unknown record ignored");
                return Ok(false);
            }
        };
        let deleted = self.with_registry(registry_id, |_| {
            if self.record_keeper.lock()?.get(&id).is_none() {
                return Ok(false);
            }
            self.persistor.lock()?.delete_record(&id)?;
            self.record_keeper.lock()?.remove(&id);
            Ok(true)
        });
        match deleted {
            Ok(true) => {
                debug!(registry = %registry_id, record = %id, "record deleted");
                Ok(true)
            }
            // the registry went away, and the record with it
            Err(RegistrarError::NotFound { .. }) => Ok(false),
            other => other,
        }
    }
    /// Records of a registry in creation order.
    pub fn list_records(&self, registry_id: RegistryId) -> Result<Vec<Record>> {
        self.with_registry(registry_id, |_| Ok(self.record_keeper.lock()?.records_of(&registry_id)))
    }
    /// The current schema together with the records, read under one lock.
    pub fn snapshot(&self, registry_id: RegistryId) -> Result<(Registry, Vec<Record>)> {
        self.with_registry(registry_id, |registry| {
            Ok((registry.clone(), self.record_keeper.lock()?.records_of(&registry_id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_options_are_retired_and_can_come_back() {
        let mut column = ColumnDef::new("Status", ColumnType::Select, vec!["Active".into(), "Retired".into()]);
        column.set_options(vec!["Active".into()]);
        assert_eq!(column.options, vec!["Active".to_string()]);
        assert_eq!(column.retired_options(), ["Retired".to_string()]);
        assert!(column.accepts_option("Retired"));
        column.set_options(vec!["Active".into(), "Retired".into()]);
        assert!(column.retired_options().is_empty());
    }

    #[test]
    fn lookup_keeps_insertion_order() {
        let mut lookup: Lookup<u8, u8, KeeperHasher> = Lookup::new();
        lookup.insert(1, 3);
        lookup.insert(1, 1);
        lookup.insert(1, 2);
        lookup.remove(&1, &1);
        assert_eq!(lookup.lookup(&1), &[3, 2]);
        assert!(lookup.lookup(&2).is_empty());
        assert_eq!(lookup.take(&1), vec![3, 2]);
    }

    #[test]
    fn identities_parse_back() {
        let id = ColumnId::generate();
        assert_eq!(id.to_string().parse::<ColumnId>().ok(), Some(id));
        assert!("not-an-id".parse::<ColumnId>().is_err());
    }

    #[test]
    fn claims_are_sequential() {
        let mut registry = Registry {
            id: RegistryId::generate(),
            name: "r".into(),
            description: None,
            columns: vec![],
            next_autonumber: Registry::FIRST_AUTONUMBER,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            owner: "o".into(),
        };
        assert_eq!(registry.claim_autonumber(), 1);
        assert_eq!(registry.claim_autonumber(), 2);
        assert_eq!(registry.next_autonumber, 3);
    }
}
