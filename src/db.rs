//! Interactions with the sqlite capture-event database
use rusqlite::{Connection, Result};
use std::path::PathBuf;

/// Connect to the database, and create the event tables if they don't already exist
pub fn connect_and_create(db_path: PathBuf) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS capture (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        leader_ts_ns INTEGER NOT NULL,
        local_ts_ns INTEGER NOT NULL,
        goal_ns INTEGER NOT NULL,
        lead_underflow INTEGER NOT NULL,
        directory TEXT NOT NULL
    ) STRICT;",
        (),
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS offset_update (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        peer TEXT NOT NULL,
        offset_ns INTEGER NOT NULL,
        error_bound_ns INTEGER NOT NULL
    ) STRICT;",
        (),
    )?;
    Ok(conn)
}

/// Rows the pipeline tasks push at the db task
#[derive(Debug)]
pub enum EventRecord {
    Capture(CaptureRecord),
    OffsetUpdate(OffsetRecord),
}

impl EventRecord {
    pub fn db_insert(&self, conn: &Connection) -> Result<()> {
        match self {
            EventRecord::Capture(r) => r.db_insert(conn),
            EventRecord::OffsetUpdate(r) => r.db_insert(conn),
        }
    }
}

#[derive(Debug)]
pub struct CaptureRecord {
    pub leader_ts_ns: i64,
    pub local_ts_ns: i64,
    pub goal_ns: i64,
    pub lead_underflow: bool,
    pub directory: String,
}

impl CaptureRecord {
    /// Insert a persisted-capture record into the connected database
    pub fn db_insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO capture (leader_ts_ns, local_ts_ns, goal_ns, lead_underflow, directory)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                &self.leader_ts_ns,
                &self.local_ts_ns,
                &self.goal_ns,
                &self.lead_underflow,
                &self.directory,
            ),
        )?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct OffsetRecord {
    pub peer: String,
    pub offset_ns: i64,
    pub error_bound_ns: i64,
}

impl OffsetRecord {
    /// Insert an offset-negotiation record into the connected database
    pub fn db_insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO offset_update (peer, offset_ns, error_bound_ns) VALUES (?1, ?2, ?3)",
            (&self.peer, &self.offset_ns, &self.error_bound_ns),
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn records_insert_into_a_fresh_db() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connect_and_create(dir.path().join("events.db")).unwrap();
        EventRecord::Capture(CaptureRecord {
            leader_ts_ns: 10_010_000,
            local_ts_ns: 9_990_000,
            goal_ns: 10_000_000,
            lead_underflow: false,
            directory: "00000000000010010000".to_string(),
        })
        .db_insert(&conn)
        .unwrap();
        EventRecord::OffsetUpdate(OffsetRecord {
            peer: "10.0.0.2:55555".to_string(),
            offset_ns: 999_950,
            error_bound_ns: 50,
        })
        .db_insert(&conn)
        .unwrap();
        let captures: i64 = conn
            .query_row("SELECT COUNT(*) FROM capture", (), |row| row.get(0))
            .unwrap();
        assert_eq!(captures, 1);
    }
}
