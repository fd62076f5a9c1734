use rusqlite::Connection;

use crate::db::schema;
use crate::db::DbError;

/// Ordered migration steps. `PRAGMA user_version` records how many have been
/// applied, so the database file carries its own version without an extra
/// bookkeeping table.
const MIGRATIONS: &[fn(&Connection) -> rusqlite::Result<()>] = &[schema::create_schema];

pub fn migrate(conn: &Connection) -> Result<(), DbError> {
    let applied = applied_count(conn)?;
    if applied > MIGRATIONS.len() {
        return Err(DbError::Config(format!(
            "database was written by a newer build: {applied} migrations applied, only {} known",
            MIGRATIONS.len()
        )));
    }

    // Each pending step commits atomically with its version bump; a crash
    // mid-migration leaves the file at the last completed step.
    for (index, step) in MIGRATIONS.iter().enumerate().skip(applied) {
        let tx = conn.unchecked_transaction()?;
        step(&tx)?;
        tx.pragma_update(None, "user_version", (index + 1) as i64)?;
        tx.commit()?;
    }

    Ok(())
}

fn applied_count(conn: &Connection) -> Result<usize, DbError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version as usize)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rusqlite::Connection;
    use uuid::Uuid;

    use super::{applied_count, migrate, MIGRATIONS};
    use crate::db::DbError;

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mailsync-migrations-{}.db", Uuid::new_v4()));
        path
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        stmt.query_map([], |row| row.get::<_, String>(0))
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("collect")
    }

    #[test]
    fn fresh_database_gets_every_step_and_the_sync_tables() {
        let path = temp_db_path();
        let conn = Connection::open(&path).expect("open");

        migrate(&conn).expect("migrate");

        assert_eq!(applied_count(&conn).expect("version"), MIGRATIONS.len());
        let tables = table_names(&conn);
        assert!(tables.iter().any(|t| t == "accounts"));
        assert!(tables.iter().any(|t| t == "threads"));
        assert!(tables.iter().any(|t| t == "messages"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rerunning_migrate_applies_nothing_new() {
        let path = temp_db_path();
        let conn = Connection::open(&path).expect("open");

        migrate(&conn).expect("first migrate");
        migrate(&conn).expect("second migrate");

        assert_eq!(applied_count(&conn).expect("version"), MIGRATIONS.len());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn database_from_a_newer_build_is_rejected() {
        let path = temp_db_path();
        let conn = Connection::open(&path).expect("open");
        conn.pragma_update(None, "user_version", (MIGRATIONS.len() + 1) as i64)
            .expect("bump version");

        let error = migrate(&conn).expect_err("newer database");
        assert!(matches!(error, DbError::Config(_)));

        let _ = std::fs::remove_file(path);
    }
}
