//! Redshift over the Postgres wire protocol.
//!
//! Sequence numbers live in varchar columns and are parsed back into
//! [`SequenceNumber`] here; the SQL never compares them. Redshift has no
//! array binds, so `IN` lists are expanded into numbered placeholders.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use snafu::prelude::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use tracing::{debug, info};

use super::{
    BulkLoadRequest, BulkLoadStatus, LOAD_ERROR_LIMIT, LoadErrorRow, Warehouse,
    WarehouseTransaction, first_query_only,
};
use crate::checkpoint::{CheckpointRow, LedgerKey, NewCheckpoint};
use crate::config::WarehouseConfig;
use crate::error::{ConnectSnafu, LedgerSequenceSnafu, SqlSnafu, WarehouseError};
use crate::sequence::SequenceNumber;

const LEDGER_COLUMNS: &str = "stream_name, shard_id, table_name, \
     starting_sequence_number, ending_sequence_number, load_timestamp";

type LedgerTuple = (String, String, String, String, String, NaiveDateTime);
type LoadErrorTuple = (i64, String, i64, String, String, String, i32, String);

/// Pooled connection to a Redshift cluster.
#[derive(Clone)]
pub struct RedshiftWarehouse {
    pool: PgPool,
    ledger_table: String,
}

impl RedshiftWarehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context(ConnectSnafu)?;
        info!(ledger_table = %config.ledger_table, "Connected to warehouse");

        Ok(Self {
            pool,
            ledger_table: config.ledger_table.clone(),
        })
    }
}

#[async_trait]
impl Warehouse for RedshiftWarehouse {
    async fn begin(&self) -> Result<Box<dyn WarehouseTransaction>, WarehouseError> {
        let tx = self
            .pool
            .begin()
            .await
            .context(SqlSnafu { statement: "begin" })?;
        Ok(Box::new(RedshiftTransaction {
            tx,
            ledger_table: self.ledger_table.clone(),
        }))
    }

    async fn recent_checkpoints(
        &self,
        key: &LedgerKey,
        limit: usize,
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        let (sql, binds) = recent_checkpoints_sql(&self.ledger_table, key, limit);
        fetch_checkpoints(&self.pool, &sql, binds).await
    }

    async fn checkpoints(
        &self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        let (sql, binds) = checkpoints_sql(&self.ledger_table, table, stream, shard_ids);
        fetch_checkpoints(&self.pool, &sql, binds).await
    }

    async fn load_errors(
        &self,
        table: &str,
        files: &[String],
    ) -> Result<Vec<LoadErrorRow>, WarehouseError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let sql = load_errors_sql(files.len());
        // stv_tbl_perm holds unqualified names.
        let bare_table = table.rsplit('.').next().unwrap_or(table);
        let mut query = sqlx::query_as::<_, LoadErrorTuple>(&sql).bind(bare_table);
        for file in files {
            query = query.bind(file);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context(SqlSnafu {
                statement: "select stl_load_errors",
            })?
            .into_iter()
            .map(
                |(
                    query_id,
                    filename,
                    line_number,
                    column,
                    raw_line,
                    raw_field_value,
                    error_code,
                    reason,
                )| LoadErrorRow {
                    query_id,
                    filename,
                    line_number,
                    column,
                    raw_line,
                    raw_field_value,
                    error_code,
                    reason,
                },
            )
            .collect();
        Ok(first_query_only(rows))
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<(), WarehouseError> {
        sqlx::raw_sql(ddl)
            .execute(&self.pool)
            .await
            .context(SqlSnafu { statement: "ddl" })?;
        Ok(())
    }
}

/// One open Redshift transaction.
pub struct RedshiftTransaction {
    tx: Transaction<'static, Postgres>,
    ledger_table: String,
}

#[async_trait]
impl WarehouseTransaction for RedshiftTransaction {
    async fn recent_checkpoints(
        &mut self,
        key: &LedgerKey,
        limit: usize,
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        let (sql, binds) = recent_checkpoints_sql(&self.ledger_table, key, limit);
        fetch_checkpoints(&mut *self.tx, &sql, binds).await
    }

    async fn checkpoints(
        &mut self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        let (sql, binds) = checkpoints_sql(&self.ledger_table, table, stream, shard_ids);
        fetch_checkpoints(&mut *self.tx, &sql, binds).await
    }

    async fn insert_checkpoints(&mut self, rows: &[NewCheckpoint]) -> Result<(), WarehouseError> {
        if rows.is_empty() {
            return Ok(());
        }

        let sql = insert_checkpoints_sql(&self.ledger_table, rows.len());
        let mut query = sqlx::query(&sql);
        for row in rows {
            query = query
                .bind(&row.key.stream)
                .bind(&row.key.shard_id)
                .bind(&row.key.table)
                .bind(row.range.start.to_string())
                .bind(row.range.end.to_string());
        }
        query.execute(&mut *self.tx).await.context(SqlSnafu {
            statement: "insert checkpoints",
        })?;
        debug!(rows = rows.len(), "Inserted checkpoint rows");
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        request: &BulkLoadRequest,
    ) -> Result<BulkLoadStatus, WarehouseError> {
        let sql = copy_sql(request);
        match sqlx::Executor::execute(&mut *self.tx, sqlx::raw_sql(&sql)).await {
            Ok(_) => {}
            // The server rejected the load; the transaction is now aborted.
            Err(sqlx::Error::Database(e)) => {
                return Ok(BulkLoadStatus::Failed {
                    message: e.message().to_string(),
                });
            }
            Err(source) => return Err(source).context(SqlSnafu { statement: "copy" }),
        }

        let rows: i64 = sqlx::query_scalar("SELECT pg_last_copy_count()::bigint")
            .fetch_one(&mut *self.tx)
            .await
            .context(SqlSnafu {
                statement: "pg_last_copy_count",
            })?;
        Ok(BulkLoadStatus::Loaded {
            rows: rows.max(0) as u64,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError> {
        self.tx
            .commit()
            .await
            .context(SqlSnafu { statement: "commit" })
    }

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError> {
        self.tx
            .rollback()
            .await
            .context(SqlSnafu {
                statement: "rollback",
            })
    }
}

async fn fetch_checkpoints<'e, E>(
    executor: E,
    sql: &str,
    binds: Vec<String>,
) -> Result<Vec<CheckpointRow>, WarehouseError>
where
    E: PgExecutor<'e>,
{
    let mut query = sqlx::query_as::<_, LedgerTuple>(sql);
    for value in binds {
        query = query.bind(value);
    }
    let rows = query.fetch_all(executor).await.context(SqlSnafu {
        statement: "select checkpoints",
    })?;
    rows.into_iter().map(checkpoint_from_tuple).collect()
}

fn checkpoint_from_tuple(
    (stream_name, shard_id, table_name, start, end, load_timestamp): LedgerTuple,
) -> Result<CheckpointRow, WarehouseError> {
    let starting_sequence_number = start
        .trim()
        .parse::<SequenceNumber>()
        .context(LedgerSequenceSnafu {
            shard_id: &shard_id,
        })?;
    let ending_sequence_number = end
        .trim()
        .parse::<SequenceNumber>()
        .context(LedgerSequenceSnafu {
            shard_id: &shard_id,
        })?;

    Ok(CheckpointRow {
        stream_name,
        shard_id,
        table_name,
        starting_sequence_number,
        ending_sequence_number,
        load_timestamp,
    })
}

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn recent_checkpoints_sql(ledger: &str, key: &LedgerKey, limit: usize) -> (String, Vec<String>) {
    let sql = format!(
        "SELECT {LEDGER_COLUMNS} FROM {ledger} \
         WHERE table_name = $1 AND stream_name = $2 AND shard_id = $3 \
         ORDER BY load_timestamp DESC LIMIT {limit}"
    );
    (
        sql,
        vec![key.table.clone(), key.stream.clone(), key.shard_id.clone()],
    )
}

fn checkpoints_sql(
    ledger: &str,
    table: &str,
    stream: &str,
    shard_ids: &[String],
) -> (String, Vec<String>) {
    let mut sql = format!(
        "SELECT {LEDGER_COLUMNS} FROM {ledger} WHERE table_name = $1 AND stream_name = $2"
    );
    if !shard_ids.is_empty() {
        sql.push_str(&format!(
            " AND shard_id IN ({})",
            placeholders(3, shard_ids.len())
        ));
    }
    sql.push_str(" ORDER BY load_timestamp");

    let mut binds = vec![table.to_string(), stream.to_string()];
    binds.extend(shard_ids.iter().cloned());
    (sql, binds)
}

fn insert_checkpoints_sql(ledger: &str, rows: usize) -> String {
    let values = (0..rows)
        .map(|i| format!("({}, GETDATE())", placeholders(i * 5 + 1, 5)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {ledger} ({LEDGER_COLUMNS}) VALUES {values}")
}

fn load_errors_sql(files: usize) -> String {
    format!(
        "SELECT sl.query::bigint, TRIM(sl.filename), sl.line_number::bigint, TRIM(sl.colname), \
         TRIM(sl.raw_line), TRIM(sl.raw_field_value), sl.err_code::int, TRIM(sl.err_reason) \
         FROM stl_load_errors sl \
         WHERE sl.tbl IN (SELECT DISTINCT id FROM stv_tbl_perm WHERE TRIM(name) = $1) \
         AND TRIM(sl.filename) IN ({}) \
         ORDER BY sl.starttime DESC LIMIT {LOAD_ERROR_LIMIT}",
        placeholders(2, files)
    )
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `COPY` statement for a manifest of gzip-compressed JSON lines.
pub fn copy_sql(request: &BulkLoadRequest) -> String {
    let mut sql = format!(
        "COPY {} FROM {}",
        request.table,
        quote_literal(&request.manifest_url)
    );
    if let Some(credentials) = &request.credentials {
        sql.push_str(&format!(" CREDENTIALS {}", quote_literal(credentials)));
    }
    sql.push_str(&format!(
        " JSON 'auto' TIMEFORMAT 'auto' GZIP MAXERROR {} MANIFEST",
        request.max_error
    ));
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(credentials: Option<&str>) -> BulkLoadRequest {
        BulkLoadRequest {
            table: "clicks".into(),
            manifest_url: "s3://stage/floe/load-1/manifest.json".into(),
            max_error: 2,
            credentials: credentials.map(str::to_string),
        }
    }

    #[test]
    fn test_copy_sql() {
        assert_eq!(
            copy_sql(&request(None)),
            "COPY clicks FROM 's3://stage/floe/load-1/manifest.json' \
             JSON 'auto' TIMEFORMAT 'auto' GZIP MAXERROR 2 MANIFEST"
        );
    }

    #[test]
    fn test_copy_sql_escapes_credentials() {
        let sql = copy_sql(&request(Some("aws_iam_role=arn:aws:iam::1:role/o'brien")));
        assert!(sql.contains("CREDENTIALS 'aws_iam_role=arn:aws:iam::1:role/o''brien'"));
    }

    #[test]
    fn test_checkpoints_sql_placeholders() {
        let (sql, binds) = checkpoints_sql(
            "kinesis_loads",
            "clicks",
            "a.b.clicks",
            &["s1".to_string(), "s2".to_string()],
        );
        assert!(sql.contains("shard_id IN ($3, $4)"));
        assert_eq!(binds, vec!["clicks", "a.b.clicks", "s1", "s2"]);

        let (sql, binds) = checkpoints_sql("kinesis_loads", "clicks", "a.b.clicks", &[]);
        assert!(!sql.contains("shard_id IN"));
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn test_insert_sql_numbers_every_row() {
        let sql = insert_checkpoints_sql("kinesis_loads", 2);
        assert!(sql.ends_with("VALUES ($1, $2, $3, $4, $5, GETDATE()), ($6, $7, $8, $9, $10, GETDATE())"));
    }

    #[test]
    fn test_load_errors_sql() {
        let sql = load_errors_sql(3);
        assert!(sql.contains("IN ($2, $3, $4)"));
        assert!(sql.ends_with("LIMIT 20"));
    }

    #[test]
    fn test_invalid_ledger_sequence() {
        let tuple = (
            "a.b.clicks".to_string(),
            "s1".to_string(),
            "clicks".to_string(),
            "12x".to_string(),
            "200".to_string(),
            NaiveDateTime::default(),
        );
        assert!(matches!(
            checkpoint_from_tuple(tuple),
            Err(WarehouseError::LedgerSequence { .. })
        ));
    }
}
