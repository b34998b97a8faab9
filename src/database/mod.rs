pub mod models;
pub mod schema;

use diesel::{prelude::*, sqlite::SqliteConnection};

const CREATE_BACKUP_RECORDS: &str = "CREATE TABLE IF NOT EXISTS backup_records (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Opens (creating if needed) the sqlite file at `path` and makes sure the
/// backup table exists.
pub fn establish(path: &str) -> anyhow::Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(path)?;
    diesel::sql_query(CREATE_BACKUP_RECORDS).execute(&mut conn)?;
    Ok(conn)
}
