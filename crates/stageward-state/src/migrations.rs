//! SurrealDB schema initialization
//!
//! Safe to call on every connection (idempotent `DEFINE ... ` statements).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;

/// Initialize all Stageward tables in SurrealDB.
pub async fn init_schema(db: &Surreal<Any>) -> Result<(), StorageError> {
    info!("Initializing Stageward SurrealDB schema");

    init_incidents_table(db).await?;
    init_open_incidents_table(db).await?;

    info!("Stageward schema initialization complete");
    Ok(())
}

/// Initialize `incidents` table
///
/// Schema:
/// ```text
/// TABLE incidents {
///   incident_id:  STRING (unique)
///   key_id:       STRING (indexed, "<environment>/<category>")
///   environment:  STRING
///   category:     STRING
///   title:        STRING
///   body:         STRING
///   labels:       ARRAY<STRING>
///   state:        STRING (open | closed)
///   created_at:   DATETIME
///   closed_at:    DATETIME?
/// }
/// ```
async fn init_incidents_table(db: &Surreal<Any>) -> Result<(), StorageError> {
    debug!("Initializing incidents table");

    let sql = r#"
        DEFINE TABLE incidents SCHEMALESS;

        DEFINE INDEX idx_incident_id ON TABLE incidents COLUMNS incident_id UNIQUE;
        DEFINE INDEX idx_incident_key ON TABLE incidents COLUMNS key_id;
        DEFINE INDEX idx_incident_state ON TABLE incidents COLUMNS state;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to init incidents table: {e}")))?;

    Ok(())
}

/// Initialize `open_incidents` table
///
/// One record per open key; the record id IS the key id, so a second
/// `CREATE open_incidents:<key>` fails while the first is still present.
/// This is what makes `create_if_absent` atomic.
async fn init_open_incidents_table(db: &Surreal<Any>) -> Result<(), StorageError> {
    debug!("Initializing open_incidents table");

    let sql = r#"
        DEFINE TABLE open_incidents SCHEMALESS;
        DEFINE INDEX idx_open_incident_id ON TABLE open_incidents COLUMNS incident_id UNIQUE;
    "#;

    db.query(sql).await.map_err(|e| {
        StorageError::Backend(format!("Failed to init open_incidents table: {e}"))
    })?;

    Ok(())
}
