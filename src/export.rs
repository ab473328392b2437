//! CSV export of a registry.
//!
//! Every export starts with a UTF-8 byte-order mark so that spreadsheet tools
//! pick the right encoding for non-ASCII names. The document is built in
//! memory and only handed out once it is complete.

use csv::{QuoteStyle, WriterBuilder};
use tracing::{error, info};

use crate::construct::{Database, Record, Registry, RegistryId};
use crate::datatype::Rendering;
use crate::error::{RegistrarError, Result};

pub const BYTE_ORDER_MARK: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl CsvExport {
    /// The CSV text without the byte-order mark.
    pub fn text(&self) -> Result<&str> {
        let body = self.bytes.strip_prefix(BYTE_ORDER_MARK).unwrap_or(&self.bytes);
        std::str::from_utf8(body).map_err(|e| RegistrarError::Export(e.to_string()))
    }
}

/// Writes the header and one row per record, cells in column order.
pub fn write_csv(registry: &Registry, records: &[Record], rendering: &Rendering) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .from_writer(BYTE_ORDER_MARK.to_vec());
    writer.write_record(registry.columns.iter().map(|c| c.name.as_str()))?;
    for record in records {
        writer.write_record(
            record
                .project(registry)
                .map(|(_, value)| rendering.render_cell(value)),
        )?;
    }
    writer
        .into_inner()
        .map_err(|e| RegistrarError::Export(e.to_string()))
}

pub fn export_csv(database: &Database, registry_id: RegistryId) -> Result<CsvExport> {
    let (registry, records) = database.snapshot(registry_id)?;
    let bytes = write_csv(&registry, &records, database.rendering()).inspect_err(|e| {
        error!(registry = %registry_id, error = %e, "export failed");
    })?;
    info!(registry = %registry_id, rows = records.len(), bytes = bytes.len(), "registry exported");
    Ok(CsvExport {
        file_name: format!("{}.csv", registry.name),
        bytes,
    })
}
