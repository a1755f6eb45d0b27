//! Year-scoped display-ID allocation

use rusqlite::{Connection, params};

use crate::storage::error::StorageResult;

/// Allocates `SES-<year>-<seq>` display identifiers.
///
/// The increment-and-read is a single upsert against the per-year counter
/// row, so two concurrent creations can never observe the same value. Each
/// year's counter starts at 1 and the sequence width grows past four digits
/// instead of wrapping.
pub struct DisplayIdSequencer;

impl DisplayIdSequencer {
    /// Allocates the next display ID for the given year.
    pub fn next(conn: &Connection, year: i32) -> StorageResult<String> {
        let seq: i64 = conn.query_row(
            r#"
            INSERT INTO display_id_counters (year, counter) VALUES (?1, 1)
            ON CONFLICT(year) DO UPDATE SET counter = counter + 1
            RETURNING counter
            "#,
            params![year],
            |row| row.get(0),
        )?;
        Ok(format!("SES-{year}-{seq:04}"))
    }
}
