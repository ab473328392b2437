// used for persistence
use rusqlite::{Connection, OptionalExtension, params};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::construct::{ColumnDef, ColumnId, Data, PersistenceMode, Record, RecordId, Registry, RegistryId};
use crate::datatype::ColumnType;
use crate::error::{RegistrarError, Result};

// ------------- Persistence -------------
pub struct Persistor {
    db: Connection,
}

impl Persistor {
    pub fn open(mode: &PersistenceMode) -> Result<Self> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        Self::new(connection)
    }
    pub fn new(connection: Connection) -> Result<Self> {
        // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            pragma foreign_keys = on;
            create table if not exists Registry (
                Registry_Identity text not null,
                Name text not null,
                Description text null,
                NextAutonumber integer not null,
                Owner text not null,
                CreatedAt text not null,
                UpdatedAt text not null,
                constraint referenceable_Registry_Identity primary key (
                    Registry_Identity
                )
            );-- STRICT;
            create table if not exists RegistryColumn (
                Column_Identity text not null,
                Registry_Identity text not null,
                Name text not null,
                ColumnType text not null,
                Options text not null,
                RetiredOptions text not null,
                Position integer not null,
                constraint Column_in_Registry foreign key (
                    Registry_Identity
                ) references Registry(Registry_Identity) on delete cascade,
                constraint referenceable_Column_Identity primary key (
                    Column_Identity
                )
            );-- STRICT;
            create table if not exists Record (
                Record_Identity text not null,
                Registry_Identity text not null,
                Data text not null,
                CreatedAt text not null,
                UpdatedAt text not null,
                constraint Record_in_Registry foreign key (
                    Registry_Identity
                ) references Registry(Registry_Identity) on delete cascade,
                constraint referenceable_Record_Identity primary key (
                    Record_Identity
                )
            );-- STRICT;
            create index if not exists Record_by_Registry on Record (
                Registry_Identity
            );
            ",
        )?;
        Ok(Persistor { db: connection })
    }

    /// Writes a registry and its complete current schema.
    pub fn persist_registry(&mut self, registry: &Registry) -> Result<()> {
        let tx = self.db.transaction()?;
        let existing = tx
            .prepare_cached(
                "
                select Registry_Identity
                    from Registry
                    where Registry_Identity = ?
            ",
            )?
            .query_row(params![registry.id.to_string()], |r| r.get::<_, String>(0))
            .optional()?;
        match existing {
            Some(_) => {
                tx.prepare_cached(
                    "
                    update Registry
                        set Name = ?,
                            Description = ?,
                            NextAutonumber = ?,
                            UpdatedAt = ?
                        where Registry_Identity = ?
                ",
                )?
                .execute(params![
                    &registry.name,
                    &registry.description,
                    &registry.next_autonumber,
                    &registry.updated_at,
                    registry.id.to_string()
                ])?;
            }
            None => {
                tx.prepare_cached(
                    "
                    insert into Registry (
                        Registry_Identity,
                        Name,
                        Description,
                        NextAutonumber,
                        Owner,
                        CreatedAt,
                        UpdatedAt
                    ) values (?, ?, ?, ?, ?, ?, ?)
                ",
                )?
                .execute(params![
                    registry.id.to_string(),
                    &registry.name,
                    &registry.description,
                    &registry.next_autonumber,
                    &registry.owner,
                    &registry.created_at,
                    &registry.updated_at
                ])?;
            }
        }
        // the schema is small, so it is simply rewritten
        tx.prepare_cached(
            "
            delete from RegistryColumn
                where Registry_Identity = ?
        ",
        )?
        .execute(params![registry.id.to_string()])?;
        {
            let mut add_column = tx.prepare_cached(
                "
                insert into RegistryColumn (
                    Column_Identity,
                    Registry_Identity,
                    Name,
                    ColumnType,
                    Options,
                    RetiredOptions,
                    Position
                ) values (?, ?, ?, ?, ?, ?, ?)
            ",
            )?;
            for column in &registry.columns {
                add_column.execute(params![
                    column.id.to_string(),
                    registry.id.to_string(),
                    &column.name,
                    &column.column_type,
                    serde_json::to_string(&column.options)?,
                    serde_json::to_string(column.retired_options())?,
                    column.order as i64
                ])?;
            }
        }
        tx.commit()?;
        debug!(registry = %registry.id, "registry persisted");
        Ok(())
    }

    /// Stores a new record together with the registry's advanced counter, so
    /// a restart never hands out a number twice.
    pub fn persist_created_record(&mut self, record: &Record, next_autonumber: i64) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.prepare_cached(
            "
            update Registry
                set NextAutonumber = ?
                where Registry_Identity = ?
        ",
        )?
        .execute(params![next_autonumber, record.registry_id.to_string()])?;
        tx.prepare_cached(
            "
            insert into Record (
                Record_Identity,
                Registry_Identity,
                Data,
                CreatedAt,
                UpdatedAt
            ) values (?, ?, ?, ?, ?)
        ",
        )?
        .execute(params![
            record.id.to_string(),
            record.registry_id.to_string(),
            serde_json::to_string(&record.data)?,
            &record.created_at,
            &record.updated_at
        ])?;
        tx.commit()?;
        Ok(())
    }

    pub fn persist_updated_record(&mut self, record: &Record) -> Result<()> {
        let changed = self
            .db
            .prepare_cached(
                "
                update Record
                    set Data = ?,
                        UpdatedAt = ?
                    where Record_Identity = ?
            ",
            )?
            .execute(params![
                serde_json::to_string(&record.data)?,
                &record.updated_at,
                record.id.to_string()
            ])?;
        if changed != 1 {
            return Err(RegistrarError::Invariant(format!(
                "record {} is kept but not persisted",
                record.id
            )));
        }
        Ok(())
    }

    pub fn delete_record(&mut self, record: &RecordId) -> Result<()> {
        self.db
            .prepare_cached(
                "
                delete from Record
                    where Record_Identity = ?
            ",
            )?
            .execute(params![record.to_string()])?;
        Ok(())
    }

    pub fn delete_registry(&mut self, registry: &RegistryId) -> Result<()> {
        let tx = self.db.transaction()?;
        for statement in [
            "delete from Record where Registry_Identity = ?",
            "delete from RegistryColumn where Registry_Identity = ?",
            "delete from Registry where Registry_Identity = ?",
        ] {
            tx.prepare_cached(statement)?
                .execute(params![registry.to_string()])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn restore_registries(&mut self) -> Result<Vec<Registry>> {
        let mut registries = Vec::new();
        {
            let mut all_registries = self.db.prepare_cached(
                "
                select Registry_Identity,
                        Name,
                        Description,
                        NextAutonumber,
                        Owner,
                        CreatedAt,
                        UpdatedAt
                    from Registry
                    order by rowid
            ",
            )?;
            let mut rows = all_registries.query([])?;
            while let Some(row) = rows.next()? {
                registries.push(Registry {
                    id: identity(&row.get::<_, String>(0)?)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    columns: Vec::new(),
                    next_autonumber: row.get(3)?,
                    owner: row.get(4)?,
                    created_at: row.get::<_, DateTime<Utc>>(5)?,
                    updated_at: row.get::<_, DateTime<Utc>>(6)?,
                });
            }
        }
        let mut all_columns = self.db.prepare_cached(
            "
            select Column_Identity,
                    Registry_Identity,
                    Name,
                    ColumnType,
                    Options,
                    RetiredOptions,
                    Position
                from RegistryColumn
                order by Registry_Identity, Position
        ",
        )?;
        let mut rows = all_columns.query([])?;
        while let Some(row) = rows.next()? {
            let registry_id: RegistryId = identity(&row.get::<_, String>(1)?)?;
            let column = ColumnDef::restore(
                identity::<ColumnId>(&row.get::<_, String>(0)?)?,
                row.get(2)?,
                row.get::<_, ColumnType>(3)?,
                serde_json::from_str(&row.get::<_, String>(4)?)?,
                row.get::<_, i64>(6)? as usize,
                serde_json::from_str(&row.get::<_, String>(5)?)?,
            );
            match registries.iter_mut().find(|r| r.id == registry_id) {
                Some(registry) => registry.columns.push(column),
                None => {
                    return Err(RegistrarError::Invariant(format!(
                        "column {} belongs to unknown registry {registry_id}",
                        column.id
                    )));
                }
            }
        }
        Ok(registries)
    }

    /// All records in the order they were created.
    pub fn restore_records(&mut self) -> Result<Vec<Record>> {
        let mut all_records = self.db.prepare_cached(
            "
            select Record_Identity,
                    Registry_Identity,
                    Data,
                    CreatedAt,
                    UpdatedAt
                from Record
                order by rowid
        ",
        )?;
        let mut rows = all_records.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Record {
                id: identity(&row.get::<_, String>(0)?)?,
                registry_id: identity(&row.get::<_, String>(1)?)?,
                data: serde_json::from_str::<Data>(&row.get::<_, String>(2)?)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            });
        }
        Ok(records)
    }
}

fn identity<T: std::str::FromStr<Err = uuid::Error>>(text: &str) -> Result<T> {
    text.parse::<T>()
        .map_err(|e| RegistrarError::Persistence(format!("corrupt identity '{text}': {e}")))
}
