mod schema;

pub use schema::*;

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use crate::error::CoreError;

/// Connect to SQLite database
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // An in-memory database exists per connection; more than one in the
    // pool would each see their own empty schema.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA).execute(pool).await?;

    // Additive columns for databases created by older builds
    for alter in [
        "ALTER TABLE printers ADD COLUMN dual_nozzle INTEGER DEFAULT 0",
        "ALTER TABLE printers ADD COLUMN nozzle_diameter TEXT DEFAULT '0.4'",
        "ALTER TABLE spools ADD COLUMN nozzle_temp_min INTEGER",
        "ALTER TABLE spools ADD COLUMN nozzle_temp_max INTEGER",
        "ALTER TABLE k_profiles ADD COLUMN filament_id TEXT",
    ] {
        sqlx::query(alter).execute(pool).await.ok(); // column may already exist
    }

    tracing::info!("Database migrations complete");
    Ok(())
}

/// Database schema - will be split into migrations later
const SCHEMA: &str = r#"
-- Spools table
CREATE TABLE IF NOT EXISTS spools (
    id TEXT PRIMARY KEY,
    tag_id TEXT UNIQUE,
    material TEXT NOT NULL,
    subtype TEXT,
    color_name TEXT,
    rgba TEXT,
    brand TEXT,
    label_weight INTEGER DEFAULT 1000,
    core_weight INTEGER DEFAULT 250,
    weight_current INTEGER,
    slicer_filament TEXT,
    nozzle_temp_min INTEGER,
    nozzle_temp_max INTEGER,
    note TEXT,
    tag_type TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Printers table
CREATE TABLE IF NOT EXISTS printers (
    serial TEXT PRIMARY KEY,
    name TEXT,
    model TEXT,
    ip_address TEXT,
    access_code TEXT,
    last_seen INTEGER,
    auto_connect INTEGER DEFAULT 0,
    dual_nozzle INTEGER DEFAULT 0,
    nozzle_diameter TEXT DEFAULT '0.4'
);

-- K-Profiles table
CREATE TABLE IF NOT EXISTS k_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    spool_id TEXT REFERENCES spools(id) ON DELETE CASCADE,
    printer_serial TEXT REFERENCES printers(serial) ON DELETE CASCADE,
    extruder INTEGER,
    nozzle_diameter TEXT,
    filament_id TEXT,
    k_value TEXT,
    name TEXT,
    cali_idx INTEGER,
    setting_id TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Pending slot assignments, at most one per slot
CREATE TABLE IF NOT EXISTS staged_assignments (
    printer_serial TEXT NOT NULL,
    ams_id INTEGER NOT NULL,
    tray_id INTEGER NOT NULL,
    spool_id TEXT NOT NULL REFERENCES spools(id) ON DELETE CASCADE,
    created_ts INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL,
    PRIMARY KEY (printer_serial, ams_id, tray_id)
);

-- Index for faster lookups
CREATE INDEX IF NOT EXISTS idx_spools_tag_id ON spools(tag_id);
CREATE INDEX IF NOT EXISTS idx_spools_material ON spools(material);
CREATE INDEX IF NOT EXISTS idx_k_profiles_spool ON k_profiles(spool_id);
CREATE INDEX IF NOT EXISTS idx_staged_printer ON staged_assignments(printer_serial);
"#;

pub async fn get_spool(pool: &SqlitePool, id: &str) -> Result<Option<Spool>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM spools WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_spool_by_tag(pool: &SqlitePool, tag_id: &str) -> Result<Option<Spool>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM spools WHERE tag_id = ?")
        .bind(tag_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_printer(pool: &SqlitePool, serial: &str) -> Result<Option<Printer>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM printers WHERE serial = ?")
        .bind(serial)
        .fetch_optional(pool)
        .await
}

pub async fn update_last_seen(pool: &SqlitePool, serial: &str, ts: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE printers SET last_seen = ? WHERE serial = ?")
        .bind(ts)
        .bind(serial)
        .execute(pool)
        .await?;
    Ok(())
}

/// Best K-profile for a spool on a printer: exact nozzle match first,
/// then any profile for the pair.
pub async fn k_profile_for(
    pool: &SqlitePool,
    spool_id: &str,
    printer_serial: &str,
    nozzle_diameter: &str,
) -> Result<Option<KProfileRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT * FROM k_profiles
        WHERE spool_id = ? AND printer_serial = ?
        ORDER BY (nozzle_diameter = ?) DESC, created_at DESC
        LIMIT 1
        "#,
    )
    .bind(spool_id)
    .bind(printer_serial)
    .bind(nozzle_diameter)
    .fetch_optional(pool)
    .await
}

/// Inserts or replaces the staged assignment for a slot. Returns true when
/// a prior record for the slot was replaced.
pub async fn stage_assignment(
    pool: &SqlitePool,
    staged: &StagedAssignment,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await.map_err(CoreError::Database)?;

    let existing: Option<StagedAssignment> = sqlx::query_as(
        "SELECT * FROM staged_assignments WHERE printer_serial = ? AND ams_id = ? AND tray_id = ?",
    )
    .bind(&staged.printer_serial)
    .bind(staged.ams_id)
    .bind(staged.tray_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(CoreError::Database)?;

    sqlx::query(
        r#"
        INSERT INTO staged_assignments (printer_serial, ams_id, tray_id, spool_id, created_ts, ttl_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(printer_serial, ams_id, tray_id)
        DO UPDATE SET spool_id = excluded.spool_id,
                      created_ts = excluded.created_ts,
                      ttl_ms = excluded.ttl_ms
        "#,
    )
    .bind(&staged.printer_serial)
    .bind(staged.ams_id)
    .bind(staged.tray_id)
    .bind(&staged.spool_id)
    .bind(staged.created_ts)
    .bind(staged.ttl_ms)
    .execute(&mut *tx)
    .await
    .map_err(CoreError::Database)?;

    tx.commit().await.map_err(CoreError::Database)?;
    Ok(existing.is_some())
}

pub async fn staged_for_printer(
    pool: &SqlitePool,
    printer_serial: &str,
) -> Result<Vec<StagedAssignment>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM staged_assignments WHERE printer_serial = ?")
        .bind(printer_serial)
        .fetch_all(pool)
        .await
}

pub async fn all_staged(pool: &SqlitePool) -> Result<Vec<StagedAssignment>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM staged_assignments")
        .fetch_all(pool)
        .await
}

pub async fn delete_staged(
    pool: &SqlitePool,
    printer_serial: &str,
    ams_id: i64,
    tray_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM staged_assignments WHERE printer_serial = ? AND ams_id = ? AND tray_id = ?",
    )
    .bind(printer_serial)
    .bind(ams_id)
    .bind(tray_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    async fn insert_spool(pool: &SqlitePool, id: &str) {
        sqlx::query("INSERT INTO spools (id, material) VALUES (?, 'PLA')")
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stage_replace_keeps_one_row() {
        let pool = test_pool().await;
        insert_spool(&pool, "s2").await;
        insert_spool(&pool, "s3").await;

        let first = StagedAssignment {
            printer_serial: "P1".into(),
            ams_id: 0,
            tray_id: 0,
            spool_id: "s2".into(),
            created_ts: 1000,
            ttl_ms: 3_600_000,
        };
        assert!(!stage_assignment(&pool, &first).await.unwrap());

        let second = StagedAssignment {
            spool_id: "s3".into(),
            created_ts: 2000,
            ..first.clone()
        };
        // Replacing reports the conflict
        assert!(stage_assignment(&pool, &second).await.unwrap());

        let rows = staged_for_printer(&pool, "P1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].spool_id, "s3");
    }

    #[tokio::test]
    async fn test_staged_expiry_window() {
        let staged = StagedAssignment {
            printer_serial: "P1".into(),
            ams_id: 0,
            tray_id: 1,
            spool_id: "s1".into(),
            created_ts: 10_000,
            ttl_ms: 5_000,
        };
        assert!(!staged.expired_at(14_999));
        assert!(staged.expired_at(15_000));
    }

    #[tokio::test]
    async fn test_k_profile_prefers_nozzle_match() {
        let pool = test_pool().await;
        insert_spool(&pool, "s1").await;
        sqlx::query("INSERT INTO printers (serial) VALUES ('P1')")
            .execute(&pool)
            .await
            .unwrap();
        for (diameter, k) in [("0.4", "0.025"), ("0.6", "0.040")] {
            sqlx::query(
                "INSERT INTO k_profiles (spool_id, printer_serial, nozzle_diameter, filament_id, k_value, cali_idx) \
                 VALUES ('s1', 'P1', ?, 'GFL99', ?, 1)",
            )
            .bind(diameter)
            .bind(k)
            .execute(&pool)
            .await
            .unwrap();
        }

        let profile = k_profile_for(&pool, "s1", "P1", "0.6").await.unwrap().unwrap();
        assert_eq!(profile.k_value.as_deref(), Some("0.040"));
    }
}
