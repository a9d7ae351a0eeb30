//! Derives the `trusts` lookup table from the trust columns repeated on every school row.

use std::collections::HashSet;

use gias_core::Trust;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::Database;

const CREATE_TRUSTS: &str = r#"
drop table if exists trusts cascade;
create table trusts (
    code integer not null,
    name text not null,
    unique (code, name)
);
"#;

const LINK_SCHOOLS_TO_TRUSTS: &str = r#"
alter table schools
    add constraint schools_trust_fkey
    foreign key (trust_code, trust_name) references trusts (code, name)
"#;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("trust extraction query failed during {step}: {source}")]
    QueryFailed {
        step: &'static str,
        source: sqlx::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DistinctTrusts {
    pub trusts: Vec<Trust>,
    /// Rows with a code but no name; they cannot form a pair.
    pub nameless: usize,
}

/// Collapse exact duplicate pairs, keeping first-seen order.
///
/// A code seen with two names yields two trusts; null codes are excluded whatever the name.
pub fn distinct_trusts<I>(rows: I) -> DistinctTrusts
where
    I: IntoIterator<Item = (Option<i32>, Option<String>)>,
{
    let mut seen = HashSet::new();
    let mut out = DistinctTrusts::default();
    for (code, name) in rows {
        let Some(code) = code else {
            continue;
        };
        let Some(name) = name else {
            out.nameless += 1;
            continue;
        };
        let trust = Trust { code, name };
        if seen.insert(trust.clone()) {
            out.trusts.push(trust);
        }
    }
    out
}

pub struct RelationshipExtractor<'a> {
    db: &'a mut dyn Database,
}

impl<'a> RelationshipExtractor<'a> {
    pub fn new(db: &'a mut dyn Database) -> Self {
        Self { db }
    }

    /// Recreate `trusts` from the populated `schools` table; returns the number of trusts.
    pub async fn extract_trusts(&mut self) -> Result<usize, ExtractionError> {
        self.db
            .execute(CREATE_TRUSTS)
            .await
            .map_err(|source| ExtractionError::QueryFailed {
                step: "create trusts",
                source,
            })?;

        let rows = self
            .db
            .trust_pairs()
            .await
            .map_err(|source| ExtractionError::QueryFailed {
                step: "read school trust columns",
                source,
            })?;
        let distinct = distinct_trusts(rows);
        if distinct.nameless > 0 {
            warn!(rows = distinct.nameless, "schools with a trust code but no trust name");
        }

        self.db
            .insert_trusts(&distinct.trusts)
            .await
            .map_err(|source| ExtractionError::QueryFailed {
                step: "insert trusts",
                source,
            })?;
        self.db
            .execute(LINK_SCHOOLS_TO_TRUSTS)
            .await
            .map_err(|source| ExtractionError::QueryFailed {
                step: "link schools to trusts",
                source,
            })?;

        info!(trusts = distinct.trusts.len(), "extracted trusts");
        Ok(distinct.trusts.len())
    }
}
