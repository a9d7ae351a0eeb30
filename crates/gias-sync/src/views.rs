//! Read-optimised materialized views over the production tables.

use thiserror::Error;
use tracing::info;

use crate::db::Database;

/// `(name, definition)`; definitions are created `with no data` and filled by refresh.
const VIEWS: [(&str, &str); 1] = [(
    "open_schools",
    r#"
    drop materialized view if exists open_schools;
    create materialized view open_schools as
        select s.*
          from schools s
         where s.status in ('Open', 'Open, but proposed to close')
    with no data;
    create unique index open_schools_urn_idx on open_schools (urn);
    "#,
)];

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("creating view {view}: {source}")]
    CreateFailed { view: String, source: sqlx::Error },
    #[error("refreshing view {view}: {source}")]
    RefreshFailed { view: String, source: sqlx::Error },
}

impl ViewError {
    pub fn classification(&self) -> &'static str {
        match self {
            ViewError::CreateFailed { .. } => "CreateFailed",
            ViewError::RefreshFailed { .. } => "RefreshFailed",
        }
    }
}

pub fn view_names() -> impl Iterator<Item = &'static str> {
    VIEWS.iter().map(|(name, _)| *name)
}

pub struct ViewManager<'a> {
    db: &'a mut dyn Database,
}

impl<'a> ViewManager<'a> {
    pub fn new(db: &'a mut dyn Database) -> Self {
        Self { db }
    }

    pub async fn create_views(&mut self) -> Result<(), ViewError> {
        for (view, sql) in VIEWS {
            self.db
                .execute(sql)
                .await
                .map_err(|source| ViewError::CreateFailed {
                    view: view.to_string(),
                    source,
                })?;
            info!(view, "created view");
        }
        Ok(())
    }

    /// Materialized views do not follow table replacement on their own.
    pub async fn refresh_views(&mut self) -> Result<(), ViewError> {
        for view in view_names() {
            self.db
                .execute(&format!("refresh materialized view {view}"))
                .await
                .map_err(|source| ViewError::RefreshFailed {
                    view: view.to_string(),
                    source,
                })?;
            info!(view, "refreshed view");
        }
        Ok(())
    }
}
