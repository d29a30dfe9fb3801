//! Database driver seam: executor traits, the PostgreSQL implementation and row decoding.

use crate::config::Settings;
use crate::context::Record;
use crate::error::AppError;
use crate::sql::builder::ROW_NUMBER_COLUMN;
use crate::sql::QueryBuf;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres};

/// Runs statements on one connection. Transactions are executors that can also commit;
/// on a plain connection `commit` and `rollback` are no-ops.
#[async_trait]
pub trait Executor: Send {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, AppError>;

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, AppError>;

    async fn fetch_optional(&mut self, q: &QueryBuf) -> Result<Option<Record>, AppError> {
        Ok(self.fetch_all(q).await?.into_iter().next())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Executor>, AppError>;

    async fn connection(&self) -> Result<Box<dyn Executor>, AppError>;
}

/// Roll back after a failed write, keeping the original error.
pub async fn rollback_quietly(tx: Box<dyn Executor>, err: &AppError) {
    if let Err(rb) = tx.rollback().await {
        tracing::warn!(error = %rb, cause = %err, "rollback failed");
    }
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        PgDatabase { pool }
    }

    pub async fn connect(settings: &Settings) -> Result<Self, AppError> {
        let url = settings
            .database_url
            .as_deref()
            .ok_or_else(|| AppError::Internal("DATABASE_URL is not set".into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(url)
            .await?;
        Ok(PgDatabase { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> Result<Box<dyn Executor>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn connection(&self) -> Result<Box<dyn Executor>, AppError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgPooled { conn }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

struct PgPooled {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl Executor for PgTransaction {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
        pg_fetch_all(&mut self.tx, q).await
    }

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute (tx)");
        pg_execute(&mut self.tx, q).await
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Executor for PgPooled {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        pg_fetch_all(&mut self.conn, q).await
    }

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
        pg_execute(&mut self.conn, q).await
    }
}

async fn pg_fetch_all(conn: &mut PgConnection, q: &QueryBuf) -> Result<Vec<Record>, AppError> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    let rows = query.fetch_all(&mut *conn).await?;
    Ok(rows.iter().map(row_to_json).collect())
}

async fn pg_execute(conn: &mut PgConnection, q: &QueryBuf) -> Result<u64, AppError> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

fn row_to_json(row: &PgRow) -> Record {
    use sqlx::Column;
    use sqlx::Row;
    let mut map = Record::new();
    for col in row.columns() {
        let name = col.name();
        if name == ROW_NUMBER_COLUMN {
            continue;
        }
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    map
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<String>>, _>(name) {
        return Value::Array(v.into_iter().map(Value::String).collect());
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<i64>>, _>(name) {
        return Value::Array(v.into_iter().map(|n| Value::Number(n.into())).collect());
    }
    if let Ok(Some(j)) = row.try_get::<Option<serde_json::Value>, _>(name) {
        return j;
    }
    Value::Null
}

/// Scripted in-memory database for unit tests: replies come from a closure over the SQL,
/// every statement is logged, commits and rollbacks are counted.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::sql::PgBindValue;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug)]
    pub enum Reply {
        Rows(Vec<Record>),
        Affected(u64),
        Fail(String),
    }

    #[derive(Clone, Debug)]
    pub struct Logged {
        pub sql: String,
        pub params: Vec<PgBindValue>,
        pub in_tx: bool,
    }

    type Script = dyn Fn(&str, &[PgBindValue]) -> Reply + Send + Sync;

    #[derive(Default)]
    struct MockState {
        log: Vec<Logged>,
        commits: usize,
        rollbacks: usize,
    }

    #[derive(Clone)]
    pub struct MockDatabase {
        state: Arc<Mutex<MockState>>,
        script: Arc<Script>,
    }

    impl MockDatabase {
        pub fn new(script: impl Fn(&str, &[PgBindValue]) -> Reply + Send + Sync + 'static) -> Self {
            MockDatabase {
                state: Arc::new(Mutex::new(MockState::default())),
                script: Arc::new(script),
            }
        }

        pub fn queries(&self) -> Vec<Logged> {
            self.state.lock().unwrap().log.clone()
        }

        pub fn sql(&self) -> Vec<String> {
            self.queries().into_iter().map(|l| l.sql).collect()
        }

        pub fn commits(&self) -> usize {
            self.state.lock().unwrap().commits
        }

        pub fn rollbacks(&self) -> usize {
            self.state.lock().unwrap().rollbacks
        }

        fn executor(&self, in_tx: bool) -> Box<dyn Executor> {
            Box::new(MockExecutor {
                db: self.clone(),
                in_tx,
            })
        }

        fn run(&self, q: &QueryBuf, in_tx: bool) -> Reply {
            self.state.lock().unwrap().log.push(Logged {
                sql: q.sql.clone(),
                params: q.params.clone(),
                in_tx,
            });
            (self.script)(&q.sql, &q.params)
        }
    }

    #[async_trait]
    impl Database for MockDatabase {
        async fn begin(&self) -> Result<Box<dyn Executor>, AppError> {
            Ok(self.executor(true))
        }

        async fn connection(&self) -> Result<Box<dyn Executor>, AppError> {
            Ok(self.executor(false))
        }
    }

    struct MockExecutor {
        db: MockDatabase,
        in_tx: bool,
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, AppError> {
            match self.db.run(q, self.in_tx) {
                Reply::Rows(rows) => Ok(rows),
                Reply::Affected(_) => Ok(Vec::new()),
                Reply::Fail(msg) => Err(AppError::Internal(msg)),
            }
        }

        async fn execute(&mut self, q: &QueryBuf) -> Result<u64, AppError> {
            match self.db.run(q, self.in_tx) {
                Reply::Rows(rows) => Ok(rows.len() as u64),
                Reply::Affected(n) => Ok(n),
                Reply::Fail(msg) => Err(AppError::Internal(msg)),
            }
        }

        async fn commit(self: Box<Self>) -> Result<(), AppError> {
            if self.in_tx {
                self.db.state.lock().unwrap().commits += 1;
            }
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), AppError> {
            if self.in_tx {
                self.db.state.lock().unwrap().rollbacks += 1;
            }
            Ok(())
        }
    }

    /// Build a record from a `json!({...})` object.
    pub fn rec(v: serde_json::Value) -> Record {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("rec expects an object"),
        }
    }

    pub fn rows(items: Vec<serde_json::Value>) -> Reply {
        Reply::Rows(items.into_iter().map(rec).collect())
    }

    #[tokio::test]
    async fn mock_logs_and_counts() {
        let db = MockDatabase::new(|sql, _| {
            if sql.starts_with("SELECT") {
                rows(vec![serde_json::json!({ "id": 1 })])
            } else {
                Reply::Affected(2)
            }
        });
        let mut tx = db.begin().await.unwrap();
        let q = QueryBuf {
            sql: "SELECT 1".into(),
            params: vec![],
        };
        assert_eq!(tx.fetch_all(&q).await.unwrap().len(), 1);
        let q = QueryBuf {
            sql: "DELETE".into(),
            params: vec![],
        };
        assert_eq!(tx.execute(&q).await.unwrap(), 2);
        tx.commit().await.unwrap();
        assert_eq!(db.commits(), 1);
        assert_eq!(db.rollbacks(), 0);
        assert!(db.queries().iter().all(|l| l.in_tx));
    }
}
