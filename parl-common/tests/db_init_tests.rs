//! Integration tests for database initialization and legacy schema sync
//!
//! Covers:
//! - Automatic database creation on first run
//! - Reopening an existing database
//! - Default runtime settings
//! - Column addition on tables created by an older layout

use parl_common::db::init::{
    get_setting_u64, init_database, init_in_memory, set_setting, SETTING_BUSY_TIMEOUT_MS,
    SETTING_MAX_LOCK_WAIT_MS,
};
use parl_common::db::schema_sync::SchemaIntrospector;
use parl_common::db::table_schemas::{EntitySchema, ALL_SCHEMAS};
use parl_common::EntityType;
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("parl.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("parl.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_all_canonical_tables_created() {
    let pool = init_in_memory().await.unwrap();

    for schema in ALL_SCHEMAS {
        assert!(
            SchemaIntrospector::table_exists(&pool, schema.table).await.unwrap(),
            "missing table {}",
            schema.table
        );
    }
    assert!(SchemaIntrospector::table_exists(&pool, "settings").await.unwrap());
    assert!(SchemaIntrospector::table_exists(&pool, "schema_version").await.unwrap());
}

#[tokio::test]
async fn test_default_settings_initialized() {
    let pool = init_in_memory().await.unwrap();

    assert_eq!(get_setting_u64(&pool, SETTING_MAX_LOCK_WAIT_MS, 7).await.unwrap(), 7);
    assert_eq!(get_setting_u64(&pool, SETTING_BUSY_TIMEOUT_MS, 0).await.unwrap(), 250);
    assert_eq!(get_setting_u64(&pool, "no_such_key", 42).await.unwrap(), 42);
}

#[tokio::test]
async fn test_custom_busy_timeout_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("parl.db");

    let pool = init_database(&db_path).await.unwrap();
    set_setting(&pool, SETTING_BUSY_TIMEOUT_MS, "1000").await.unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.unwrap();
    assert_eq!(get_setting_u64(&pool, SETTING_BUSY_TIMEOUT_MS, 0).await.unwrap(), 1000);
}

#[tokio::test]
async fn test_legacy_table_gains_bookkeeping_columns() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("legacy.db");

    // Old layout: committees without natural_key / timestamps / revision
    {
        let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE committees (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                jurisdiction TEXT,
                code TEXT,
                name TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO committees (jurisdiction, code, name) VALUES ('ca', 'fina', 'Finance')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let pool = init_database(&db_path).await.unwrap();

    let schema = EntitySchema::for_type(EntityType::Committee);
    let columns = SchemaIntrospector::introspect_table(&pool, schema.table).await.unwrap();
    for expected in schema.expected_columns() {
        assert!(
            columns.iter().any(|c| c.name == expected.name),
            "column {} not added",
            expected.name
        );
    }

    let (revision, first_seen): (i64, String) =
        sqlx::query_as("SELECT revision, first_seen FROM committees WHERE code = 'fina'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(revision, 0);
    assert_eq!(first_seen, parl_common::db::EPOCH_TIMESTAMP);
}
