//! The SQL-executing collaborator every loader talks to.

use async_trait::async_trait;
use gias_core::Trust;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};

/// Rows per multi-row insert; keeps bind parameters far below the protocol limit.
const INSERT_CHUNK: usize = 1_000;

/// A single exclusive database session owned by one run.
#[async_trait]
pub trait Database: Send {
    /// Execute unparameterised SQL (one or more statements); returns rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error>;

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool, sqlx::Error>;

    async fn advisory_unlock(&mut self, key: i64) -> Result<(), sqlx::Error>;

    /// `(trust_code, trust_name)` of every school with a trust code, in URN order.
    async fn trust_pairs(&mut self) -> Result<Vec<(Option<i32>, Option<String>)>, sqlx::Error>;

    async fn insert_trusts(&mut self, trusts: &[Trust]) -> Result<u64, sqlx::Error>;

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.execute("begin").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.execute("commit").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.execute("rollback").await.map(|_| ())
    }
}

pub struct PgDatabase {
    conn: PgConnection,
}

impl PgDatabase {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self { conn })
    }

    pub async fn close(self) -> Result<(), sqlx::Error> {
        self.conn.close().await
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("select pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await
    }

    async fn advisory_unlock(&mut self, key: i64) -> Result<(), sqlx::Error> {
        sqlx::query_scalar::<_, bool>("select pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn trust_pairs(&mut self) -> Result<Vec<(Option<i32>, Option<String>)>, sqlx::Error> {
        sqlx::query_as::<_, (Option<i32>, Option<String>)>(
            r#"
            SELECT trust_code, trust_name
              FROM schools
             WHERE trust_code IS NOT NULL
             ORDER BY urn
            "#,
        )
        .fetch_all(&mut self.conn)
        .await
    }

    async fn insert_trusts(&mut self, trusts: &[Trust]) -> Result<u64, sqlx::Error> {
        let mut inserted = 0;
        for chunk in trusts.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO trusts (code, name) ");
            builder.push_values(chunk, |mut row, trust| {
                row.push_bind(trust.code).push_bind(trust.name.clone());
            });
            inserted += builder.build().execute(&mut self.conn).await?.rows_affected();
        }
        Ok(inserted)
    }
}

/// Double-quote an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal for interpolation into SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
