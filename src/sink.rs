//! # Tile sink
//!
//! The pipeline's "opaque" tile container, given a real implementation:
//! an MBTiles (SQLite) file. `write_tile` is called concurrently from
//! every shard thread during pass 1; a single mutex around the
//! connection serializes the actual insert the way the upstream tool
//! brackets `mbtiles_write_tile` with a `pthread_mutex_lock`/`unlock`
//! pair — the lock's scope is exactly the SQL statement, nothing more.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};

use crate::error::CoreError;

/// Summary metadata written once, after both passes complete.
pub struct Metadata {
    pub minzoom: u8,
    pub maxzoom: u8,
    pub minlon: f64,
    pub minlat: f64,
    pub maxlon: f64,
    pub maxlat: f64,
    pub midlon: f64,
    pub midlat: f64,
    pub vector_layer: Option<&'static str>,
}

/// A destination for encoded tiles and the run's summary metadata.
pub trait TileSink: Send + Sync {
    fn write_tile(&self, z: u8, x: u32, y: u32, data: &[u8]) -> Result<(), CoreError>;
    fn write_metadata(&self, meta: &Metadata) -> Result<(), CoreError>;
    fn close(&self) -> Result<(), CoreError>;
}

/// MBTiles sink: a single SQLite connection behind a mutex, matching
/// the synchronous, non-async worker model the rest of the pipeline
/// uses (no `sqlx`/async database driver pulled in for this).
pub struct MbtilesSink {
    conn: Mutex<Connection>,
}

impl MbtilesSink {
    /// Open (creating, or truncating when `force` is set) an MBTiles
    /// file and lay down its schema.
    pub fn open(path: &Path, force: bool) -> Result<Self, CoreError> {
        if force && path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| CoreError::io(format!("removing {}", path.display()), e))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| CoreError::sink("open", e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);
             CREATE TABLE IF NOT EXISTS tiles (
                 zoom_level INTEGER,
                 tile_column INTEGER,
                 tile_row INTEGER,
                 tile_data BLOB
             );
             CREATE UNIQUE INDEX IF NOT EXISTS tile_index ON tiles
                 (zoom_level, tile_column, tile_row);",
        )
        .map_err(|e| CoreError::sink("schema", e.to_string()))?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CoreError> {
        self.conn.lock().map_err(|_| CoreError::internal("mbtiles connection mutex poisoned"))
    }
}

impl TileSink for MbtilesSink {
    fn write_tile(&self, z: u8, x: u32, y: u32, data: &[u8]) -> Result<(), CoreError> {
        // MBTiles uses a TMS (bottom-up) row index.
        let tms_row = (1u64 << z) - 1 - y as u64;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data)
             VALUES (?1, ?2, ?3, ?4)",
            params![z as i64, x as i64, tms_row as i64, data],
        )
        .map_err(|e| CoreError::sink("write_tile", e.to_string()))?;
        Ok(())
    }

    fn write_metadata(&self, meta: &Metadata) -> Result<(), CoreError> {
        let center = format!("{},{},{}", meta.midlon, meta.midlat, meta.minzoom);
        let bounds =
            format!("{},{},{},{}", meta.minlon, meta.minlat, meta.maxlon, meta.maxlat);

        let mut rows: Vec<(&str, String)> = vec![
            ("name", "tile-count".to_string()),
            ("format", if meta.vector_layer.is_some() { "pbf".to_string() } else { "png".to_string() }),
            ("minzoom", meta.minzoom.to_string()),
            ("maxzoom", meta.maxzoom.to_string()),
            ("center", center),
            ("bounds", bounds),
        ];
        if let Some(layer) = meta.vector_layer {
            rows.push((
                "json",
                format!(
                    r#"{{"vector_layers":[{{"id":"{layer}","fields":{{"density":"Number"}}}}]}}"#
                ),
            ));
        }

        let conn = self.lock()?;
        for (name, value) in rows {
            conn.execute(
                "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
                params![name, value],
            )
            .map_err(|e| CoreError::sink("write_metadata", e.to_string()))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), CoreError> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA optimize;")
            .map_err(|e| CoreError::sink("close", e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_schema_and_accepts_a_tile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mbtiles");
        let sink = MbtilesSink::open(&path, false).unwrap();
        sink.write_tile(3, 1, 2, b"fake-tile-bytes").unwrap();
        sink.write_metadata(&Metadata {
            minzoom: 0,
            maxzoom: 5,
            minlon: -10.0,
            minlat: -10.0,
            maxlon: 10.0,
            maxlat: 10.0,
            midlon: 0.0,
            midlat: 0.0,
            vector_layer: Some("count"),
        })
        .unwrap();
        sink.close().unwrap();

        let conn = Connection::open(&path).unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM tiles", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn force_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mbtiles");
        {
            let sink = MbtilesSink::open(&path, false).unwrap();
            sink.write_tile(0, 0, 0, b"x").unwrap();
        }
        let sink = MbtilesSink::open(&path, true).unwrap();
        let conn = Connection::open(&path).unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM tiles", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        drop(sink);
    }

    #[test]
    fn tile_row_uses_tms_convention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.mbtiles");
        let sink = MbtilesSink::open(&path, false).unwrap();
        sink.write_tile(2, 1, 1, b"x").unwrap();
        let conn = Connection::open(&path).unwrap();
        let row: i64 = conn
            .query_row("SELECT tile_row FROM tiles WHERE zoom_level=2", [], |r| r.get(0))
            .unwrap();
        // z=2 -> 4 rows (0..3); xyz row 1 -> tms row 4-1-1=2
        assert_eq!(row, 2);
    }
}
