//! Transient raw tables: create, bulk-copy, drop.

use std::path::Path;

use gias_core::{StagingTableDef, STAGING_TABLES};
use thiserror::Error;
use tracing::info;

use crate::db::{quote_ident, quote_literal, Database};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("creating staging table {table}: {source}")]
    StagingSchemaFailed { table: String, source: sqlx::Error },
    #[error("reading load input {path}: {source}")]
    SourceFile {
        path: String,
        source: std::io::Error,
    },
    #[error("load command for {table} rejected: {reason}")]
    CommandRejected { table: String, reason: String },
    #[error("bulk copy into {table} failed: {source}")]
    BulkCopyFailed { table: String, source: sqlx::Error },
    #[error("creating production object {object}: {source}")]
    ProductionSchemaFailed { object: String, source: sqlx::Error },
    #[error("populating {table} failed: {source}")]
    TypeCoercionFailed { table: String, source: sqlx::Error },
    #[error("dropping {what}: {source}")]
    DropFailed { what: String, source: sqlx::Error },
}

impl LoadError {
    pub fn classification(&self) -> &'static str {
        match self {
            LoadError::SourceFile { .. }
            | LoadError::CommandRejected { .. }
            | LoadError::BulkCopyFailed { .. } => "BulkCopyFailed",
            LoadError::TypeCoercionFailed { .. } => "TypeCoercionFailed",
            LoadError::StagingSchemaFailed { .. }
            | LoadError::ProductionSchemaFailed { .. }
            | LoadError::DropFailed { .. } => "SchemaFailed",
        }
    }
}

pub fn create_table_sql(def: &StagingTableDef) -> String {
    let columns = def
        .columns
        .iter()
        .map(|c| format!("{} text", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "drop table if exists {table}; create unlogged table {table} ({columns})",
        table = quote_ident(&def.name)
    )
}

pub fn copy_sql(table: &str, path: &Path) -> String {
    format!(
        "copy {} from {} with csv header",
        quote_ident(table),
        quote_literal(&path.display().to_string())
    )
}

/// Only the source named by the `from` clause matters; the path itself may contain anything.
fn check_load_command(table: &str, command: &str) -> Result<(), LoadError> {
    let reject = |reason: String| LoadError::CommandRejected {
        table: table.to_string(),
        reason,
    };
    let lowered = command.to_ascii_lowercase();
    if !lowered.trim_start().starts_with("copy") || !lowered.contains(table) {
        return Err(reject(format!("expected a copy into {table}, got {command:?}")));
    }
    match lowered.split_once(" from ") {
        None => Err(reject("command has no from clause".to_string())),
        Some((_, source)) if source.trim_start().starts_with("stdin") => {
            Err(reject("command still reads from stdin".to_string()))
        }
        Some(_) => Ok(()),
    }
}

pub fn drop_staging_sql() -> String {
    format!("drop table if exists {}", STAGING_TABLES.join(", "))
}

pub struct StagingLoader<'a> {
    db: &'a mut dyn Database,
}

impl<'a> StagingLoader<'a> {
    pub fn new(db: &'a mut dyn Database) -> Self {
        Self { db }
    }

    /// One permissive all-text table per input file.
    pub async fn create_staging(&mut self, defs: &[StagingTableDef]) -> Result<(), LoadError> {
        for def in defs {
            self.db
                .execute(&create_table_sql(def))
                .await
                .map_err(|source| LoadError::StagingSchemaFailed {
                    table: def.name.clone(),
                    source,
                })?;
            info!(table = %def.name, columns = def.columns.len(), "created staging table");
        }
        Ok(())
    }

    /// Server-side CSV-with-header copy; `path` must be absolute on the database host.
    pub async fn bulk_copy(&mut self, table: &str, path: &Path) -> Result<u64, LoadError> {
        if !path.is_absolute() {
            return Err(LoadError::CommandRejected {
                table: table.to_string(),
                reason: format!("{} is not an absolute path", path.display()),
            });
        }
        self.run_copy(table, &copy_sql(table, path)).await
    }

    /// Execute a copy command produced by the reshaper after checking it targets `table`.
    pub async fn run_load_command(&mut self, table: &str, command: &str) -> Result<u64, LoadError> {
        check_load_command(table, command)?;
        self.run_copy(table, command).await
    }

    async fn run_copy(&mut self, table: &str, sql: &str) -> Result<u64, LoadError> {
        let rows = self
            .db
            .execute(sql)
            .await
            .map_err(|source| LoadError::BulkCopyFailed {
                table: table.to_string(),
                source,
            })?;
        info!(table, rows, "bulk copied staging table");
        Ok(rows)
    }

    pub async fn drop_staging(&mut self) -> Result<(), LoadError> {
        self.db
            .execute(&drop_staging_sql())
            .await
            .map_err(|source| LoadError::DropFailed {
                what: "staging tables".to_string(),
                source,
            })?;
        info!("dropped staging tables");
        Ok(())
    }
}
