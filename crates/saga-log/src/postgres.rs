use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EntryId, InstanceHistory, InstanceId, LogEntry, LogFilter, Result, SagaLogError,
    SequenceNumber,
    log::{AppendOptions, SagaLog, validate_entry_for_append},
};

const SELECT_COLUMNS: &str = "id, instance_id, saga_type, sequence_number, entry_type, state, \
     step_index, terminal, recorded_at, payload";

/// PostgreSQL-backed saga log.
///
/// Each append runs in its own transaction and is committed before `append`
/// returns, so a successful return means the entry is durable.
#[derive(Clone)]
pub struct PostgresSagaLog {
    pool: PgPool,
}

impl PostgresSagaLog {
    /// Creates a new PostgreSQL saga log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_entry(row: PgRow) -> Result<LogEntry> {
        let step_index = row
            .try_get::<Option<i64>, _>("step_index")?
            .map(|raw| {
                usize::try_from(raw).map_err(|_| {
                    SagaLogError::InvalidEntry(format!("negative step index {raw} in saga log"))
                })
            })
            .transpose()?;

        Ok(LogEntry {
            entry_id: EntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            saga_type: row.try_get("saga_type")?,
            sequence: SequenceNumber::new(row.try_get("sequence_number")?),
            entry_type: row.try_get("entry_type")?,
            state: row.try_get("state")?,
            step_index,
            terminal: row.try_get("terminal")?,
            timestamp: row.try_get("recorded_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[async_trait]
impl SagaLog for PostgresSagaLog {
    async fn append(&self, entry: LogEntry, options: AppendOptions) -> Result<SequenceNumber> {
        let instance_id = entry.instance_id;
        let step_index = entry
            .step_index
            .map(|i| {
                i64::try_from(i)
                    .map_err(|_| SagaLogError::InvalidEntry(format!("step index {i} too large")))
            })
            .transpose()?;

        let started = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM saga_log WHERE instance_id = $1",
        )
        .bind(instance_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        let current = current.map(SequenceNumber::new).unwrap_or_default();

        validate_entry_for_append(&entry, current, &options)?;

        sqlx::query(
            r#"
            INSERT INTO saga_log (id, instance_id, saga_type, sequence_number, entry_type, state, step_index, terminal, recorded_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.entry_id.as_uuid())
        .bind(instance_id.as_uuid())
        .bind(&entry.saga_type)
        .bind(entry.sequence.as_i64())
        .bind(&entry.entry_type)
        .bind(&entry.state)
        .bind(step_index)
        .bind(entry.terminal)
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // A concurrent writer won the race for this sequence number.
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_instance_sequence")
            {
                metrics::counter!("saga_log_sequence_conflicts_total").increment(1);
                return SagaLogError::SequenceConflict {
                    instance_id,
                    expected: options.expected_sequence.unwrap_or(current),
                    actual: entry.sequence,
                };
            }
            SagaLogError::Database(e)
        })?;

        tx.commit().await?;
        metrics::histogram!("saga_log_append_seconds").record(started.elapsed().as_secs_f64());
        Ok(entry.sequence)
    }

    async fn read_instance(&self, instance_id: InstanceId) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM saga_log WHERE instance_id = $1 ORDER BY sequence_number ASC"
        ))
        .bind(instance_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn read_all(&self, filter: LogFilter) -> Result<Vec<InstanceHistory>> {
        let sql = format!(
            r#"
            WITH heads AS (
                SELECT DISTINCT ON (instance_id) instance_id, terminal, saga_type
                FROM saga_log
                ORDER BY instance_id, sequence_number DESC
            ),
            starts AS (
                SELECT instance_id, MIN(recorded_at) AS started_at
                FROM saga_log
                GROUP BY instance_id
            )
            SELECT {cols}
            FROM saga_log l
            JOIN heads h ON h.instance_id = l.instance_id
            JOIN starts s ON s.instance_id = l.instance_id
            WHERE ($1::BOOLEAN IS NULL OR h.terminal = $1)
              AND ($2::TEXT IS NULL OR h.saga_type = $2)
            ORDER BY s.started_at ASC, l.instance_id ASC, l.sequence_number ASC
            "#,
            cols = "l.id, l.instance_id, l.saga_type, l.sequence_number, l.entry_type, l.state, \
                    l.step_index, l.terminal, l.recorded_at, l.payload",
        );

        let rows = sqlx::query(&sql)
            .bind(filter.terminal)
            .bind(filter.saga_type.clone())
            .fetch_all(&self.pool)
            .await?;

        let mut histories: Vec<InstanceHistory> = Vec::new();
        for row in rows {
            let entry = Self::row_to_entry(row)?;
            match histories.last_mut() {
                Some(history) if history.instance_id == entry.instance_id => {
                    history.entries.push(entry)
                }
                _ => {
                    if filter.limit.is_some_and(|limit| histories.len() >= limit) {
                        break;
                    }
                    histories.push(InstanceHistory {
                        instance_id: entry.instance_id,
                        saga_type: entry.saga_type.clone(),
                        entries: vec![entry],
                    });
                }
            }
        }

        Ok(histories)
    }

    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Option<SequenceNumber>> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM saga_log WHERE instance_id = $1",
        )
        .bind(instance_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence.map(SequenceNumber::new))
    }
}
