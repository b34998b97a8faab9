use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::backup_records;

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug)]
#[diesel(table_name = backup_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BackupRecord {
    pub key: String,
    pub value: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = backup_records)]
pub struct NewBackupRecord<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub updated_at: NaiveDateTime,
}

impl BackupRecord {
    pub fn upsert(conn: &mut SqliteConnection, key: &str, value: &str) -> QueryResult<usize> {
        let now = chrono::Utc::now().naive_utc();
        let record = NewBackupRecord {
            key,
            value,
            updated_at: now,
        };

        diesel::insert_into(backup_records::table)
            .values(&record)
            .on_conflict(backup_records::key)
            .do_update()
            .set((
                backup_records::value.eq(value),
                backup_records::updated_at.eq(now),
            ))
            .execute(conn)
    }

    pub fn find_by_key(conn: &mut SqliteConnection, key: &str) -> QueryResult<Option<BackupRecord>> {
        backup_records::table
            .filter(backup_records::key.eq(key))
            .select(BackupRecord::as_select())
            .first(conn)
            .optional()
    }

    pub fn delete(conn: &mut SqliteConnection, key: &str) -> QueryResult<usize> {
        diesel::delete(backup_records::table.filter(backup_records::key.eq(key))).execute(conn)
    }
}
