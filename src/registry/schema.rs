//! Registry table schema and statement rendering

use serde::{Deserialize, Serialize};

use crate::store::SqlDialect;
use crate::{Error, Result};

/// Default name of the registry table
pub const DEFAULT_TABLE: &str = "shared_locks";

/// Registry column names, in table order
pub const COLUMNS: [&str; 5] = ["name", "created", "ttl", "connection_id", "lock_acquired"];

/// How table and column identifiers are quoted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStyle {
    /// `` `name` `` (MySQL default, also understood by SQLite)
    #[default]
    Backtick,
    /// `"name"` (ANSI_QUOTES)
    Ansi,
}

impl std::str::FromStr for QuoteStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "backtick" | "default" => Ok(QuoteStyle::Backtick),
            "ansi" => Ok(QuoteStyle::Ansi),
            _ => Err(Error::Config(format!("invalid quote style \"{}\"", s))),
        }
    }
}

/// Quote an identifier in the given style
pub fn quote_identifier(style: QuoteStyle, name: &str) -> String {
    match style {
        QuoteStyle::Backtick => format!("`{}`", name.replace('`', "``")),
        QuoteStyle::Ansi => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

/// Table names are rendered into statements, so only plain identifiers are accepted
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 64
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid registry table name \"{}\"", table)))
    }
}

/// Every statement the registry issues, rendered once for a table, quote style and store
#[derive(Debug, Clone)]
pub struct Statements {
    pub quoted_table: String,
    pub create: String,
    pub insert: String,
    pub confirm: String,
    pub release: String,
    pub sweep: String,
    pub remaining_ttl: String,
    pub assert_ttl: String,
    pub list: String,
}

impl Statements {
    pub fn new(table: &str, style: QuoteStyle, dialect: SqlDialect) -> Self {
        let q = |ident: &str| quote_identifier(style, ident);
        let t = q(table);
        let [name, created, ttl, connection_id, lock_acquired] = COLUMNS.map(q);
        let all_columns = COLUMNS.map(q).join(", ");
        let now = dialect.now;
        let session = dialect.session_id;

        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 {name} {name_type} NOT NULL PRIMARY KEY, \
                 {created} BIGINT NOT NULL, \
                 {ttl} BIGINT NOT NULL, \
                 {connection_id} BIGINT UNSIGNED NOT NULL, \
                 {lock_acquired} BOOLEAN NOT NULL DEFAULT FALSE){options}",
                name_type = dialect.name_type,
                options = dialect.table_options,
            ),
            insert: format!(
                "INSERT INTO {t} ({all_columns}) VALUES (?, {now}, ?, {session}, false)"
            ),
            confirm: format!(
                "UPDATE {t} SET {lock_acquired} = true WHERE {name} = ? AND {connection_id} = {session}"
            ),
            release: format!("DELETE FROM {t} WHERE {name} = ? AND {connection_id} = {session}"),
            sweep: format!(
                "DELETE FROM {t} WHERE {name} = ? AND ({created} + {ttl} < {now} OR ({lock_acquired} AND {holder} != {connection_id}))",
                holder = dialect.native_holder,
            ),
            remaining_ttl: format!("SELECT {created} + {ttl} - {now} FROM {t} WHERE {name} = ?"),
            assert_ttl: format!(
                "SELECT 1 FROM {t} WHERE {name} = ? AND {connection_id} = {session} AND {created} + {ttl} > {now} + ?"
            ),
            list: format!("SELECT {all_columns} FROM {t} ORDER BY {name}"),
            quoted_table: t,
        }
    }
}
