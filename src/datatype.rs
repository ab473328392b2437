// used for persistence
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

// used for dates in records
use chrono::NaiveDate;
use chrono::format::{Item, StrftimeItems};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

// used when parsing a string to a column type
use std::str::FromStr;
// used to print out readable forms of a data type
use std::fmt;
use std::fmt::Write;

use crate::construct::ColumnDef;

// ------------- Column types -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Number,
    Id,
    Date,
    Checkbox,
    Select,
    Multiselect,
}

impl ColumnType {
    pub const ALL: [ColumnType; 7] = [
        ColumnType::Text,
        ColumnType::Number,
        ColumnType::Id,
        ColumnType::Date,
        ColumnType::Checkbox,
        ColumnType::Select,
        ColumnType::Multiselect,
    ];
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Id => "id",
            ColumnType::Date => "date",
            ColumnType::Checkbox => "checkbox",
            ColumnType::Select => "select",
            ColumnType::Multiselect => "multiselect",
        }
    }
    /// Only choice columns carry an option list.
    pub fn has_options(&self) -> bool {
        matches!(self, ColumnType::Select | ColumnType::Multiselect)
    }
    /// Autonumbered columns are filled by the engine and never by callers.
    pub fn is_autonumber(&self) -> bool {
        matches!(self, ColumnType::Id)
    }
    /// Checks raw caller input against a column, producing the value to store.
    ///
    /// `Ok(None)` means "no value": empty or absent input is accepted for every
    /// type. Autonumber columns always yield `Ok(None)` since whatever the caller
    /// sent is ignored.
    pub fn coerce(column: &ColumnDef, raw: &Json) -> Result<Option<Value>, String> {
        if is_empty(raw) || column.column_type.is_autonumber() {
            return Ok(None);
        }
        match column.column_type {
            ColumnType::Text => match raw {
                Json::String(s) => Ok(Some(Value::Text(s.clone()))),
                Json::Number(n) => Ok(Some(Value::Text(n.to_string()))),
                Json::Bool(b) => Ok(Some(Value::Text(b.to_string()))),
                _ => Err(format!("expected text, got {}", describe(raw))),
            },
            ColumnType::Number => {
                let number = match raw {
                    Json::Number(n) => n.as_f64(),
                    Json::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match number {
                    Some(n) if n.is_finite() => Ok(Some(Value::Number(n))),
                    _ => Err(format!("expected a number, got {}", describe(raw))),
                }
            }
            ColumnType::Date => match raw {
                Json::String(s) => NaiveDate::from_str(s.trim())
                    .map(|d| Some(Value::Date(d)))
                    .map_err(|_| format!("expected an ISO-8601 date (YYYY-MM-DD), got {}", describe(raw))),
                _ => Err(format!("expected an ISO-8601 date (YYYY-MM-DD), got {}", describe(raw))),
            },
            ColumnType::Checkbox => parse_boolean(raw)
                .map(|b| Some(Value::Bool(b)))
                .ok_or_else(|| format!("expected a boolean, got {}", describe(raw))),
            ColumnType::Select => match raw {
                Json::String(s) if column.accepts_option(s) => Ok(Some(Value::Select(s.clone()))),
                Json::String(s) => Err(format!("'{s}' is not an option of this column")),
                _ => Err(format!("expected one option, got {}", describe(raw))),
            },
            ColumnType::Multiselect => {
                let entries: Vec<&str> = match raw {
                    Json::String(s) => vec![s.as_str()],
                    Json::Array(items) => {
                        let mut entries = Vec::with_capacity(items.len());
                        for item in items {
                            match item {
                                Json::String(s) => entries.push(s.as_str()),
                                other => {
                                    return Err(format!("expected options, got {}", describe(other)));
                                }
                            }
                        }
                        entries
                    }
                    _ => return Err(format!("expected a list of options, got {}", describe(raw))),
                };
                let unknown: Vec<&str> = entries
                    .iter()
                    .copied()
                    .filter(|e| !column.accepts_option(e))
                    .collect();
                if !unknown.is_empty() {
                    return Err(format!(
                        "'{}' {} not an option of this column",
                        unknown.join("', '"),
                        if unknown.len() == 1 { "is" } else { "are" }
                    ));
                }
                let mut collapsed: Vec<String> = Vec::with_capacity(entries.len());
                for entry in entries {
                    if !collapsed.iter().any(|c| c == entry) {
                        collapsed.push(entry.to_string());
                    }
                }
                Ok(Some(Value::MultiSelect(collapsed)))
            }
            ColumnType::Id => Ok(None),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ColumnType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ColumnType::ALL
            .iter()
            .find(|t| t.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown column type '{s}'"))
    }
}

impl ToSql for ColumnType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.name()))
    }
}
impl FromSql for ColumnType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        ColumnType::from_str(text).map_err(|e| FromSqlError::Other(e.into()))
    }
}

fn is_empty(raw: &Json) -> bool {
    match raw {
        Json::Null => true,
        Json::String(s) => s.trim().is_empty(),
        Json::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn describe(raw: &Json) -> String {
    match raw {
        Json::String(s) => format!("'{s}'"),
        Json::Array(_) => "a list".to_string(),
        Json::Object(_) => "an object".to_string(),
        other => other.to_string(),
    }
}

fn parse_boolean(raw: &Json) -> Option<bool> {
    match raw {
        Json::Bool(b) => Some(*b),
        Json::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Some(true),
            Some(x) if x == 0.0 => Some(false),
            _ => None,
        },
        Json::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ------------- Values --------------
/// A stored cell. Kept tagged in storage so that a value outliving its column
/// still knows what it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Number(f64),
    Id(i64),
    Date(NaiveDate),
    Bool(bool),
    Select(String),
    MultiSelect(Vec<String>),
}

impl Value {
    pub fn data_type(&self) -> ColumnType {
        match self {
            Value::Text(_) => ColumnType::Text,
            Value::Number(_) => ColumnType::Number,
            Value::Id(_) => ColumnType::Id,
            Value::Date(_) => ColumnType::Date,
            Value::Bool(_) => ColumnType::Checkbox,
            Value::Select(_) => ColumnType::Select,
            Value::MultiSelect(_) => ColumnType::Multiselect,
        }
    }
    /// The plain JSON form handed out to API callers.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Text(s) | Value::Select(s) => Json::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Id(i) => Json::from(*i),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::Bool(b) => Json::Bool(*b),
            Value::MultiSelect(entries) => {
                Json::Array(entries.iter().cloned().map(Json::String).collect())
            }
        }
    }
}

// ------------- Rendering --------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckboxStyle {
    /// ✓ / ✗
    #[default]
    Marks,
    /// Yes / No
    Words,
}

/// Canonical string forms shared by search and export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rendering {
    pub date_format: String,
    pub checkbox: CheckboxStyle,
}

impl Default for Rendering {
    fn default() -> Self {
        Self {
            date_format: String::from("%d.%m.%Y"),
            checkbox: CheckboxStyle::Marks,
        }
    }
}

impl Rendering {
    /// Rejects strftime patterns chrono cannot format.
    pub fn check(&self) -> Result<(), String> {
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            Err(format!("invalid date format '{}'", self.date_format))
        } else {
            Ok(())
        }
    }
    pub fn render(&self, value: &Value) -> String {
        match value {
            Value::Text(s) | Value::Select(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Id(i) => i.to_string(),
            Value::Date(d) => {
                let mut rendered = String::new();
                match write!(rendered, "{}", d.format(&self.date_format)) {
                    Ok(()) => rendered,
                    Err(_) => d.to_string(),
                }
            }
            Value::Bool(b) => match (self.checkbox, b) {
                (CheckboxStyle::Marks, true) => String::from("✓"),
                (CheckboxStyle::Marks, false) => String::from("✗"),
                (CheckboxStyle::Words, true) => String::from("Yes"),
                (CheckboxStyle::Words, false) => String::from("No"),
            },
            Value::MultiSelect(entries) => entries.join(", "),
        }
    }
    /// Renders an optional cell, empty when absent.
    pub fn render_cell(&self, value: Option<&Value>) -> String {
        value.map(|v| self.render(v)).unwrap_or_default()
    }
}
