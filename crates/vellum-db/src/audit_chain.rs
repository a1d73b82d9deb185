use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;
use vellum_models::audit::{AuditEntry, AuditEventType, ChainBreak, Digest};

#[derive(Debug, Clone)]
pub struct AuditChainRow {
    pub tenant_id: i64,
    pub sequence_no: i64,
    pub event_type: String,
    pub subject_id: i64,
    pub payload: String,
    pub prev_hash: String,
    pub this_hash: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for AuditChainRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            sequence_no: row.try_get("sequence_no")?,
            event_type: row.try_get("event_type")?,
            subject_id: row.try_get("subject_id")?,
            payload: row.try_get("payload")?,
            prev_hash: row.try_get("prev_hash")?,
            this_hash: row.try_get("this_hash")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

fn digest_from_hex(value: &str, what: &str, seq: i64) -> Result<Digest, DbError> {
    let bytes = hex::decode(value)
        .map_err(|e| DbError::Corrupt(format!("audit entry {seq} {what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| DbError::Corrupt(format!("audit entry {seq} {what}: wrong length")))
}

impl TryFrom<AuditChainRow> for AuditEntry {
    type Error = DbError;

    fn try_from(row: AuditChainRow) -> Result<Self, Self::Error> {
        let event_type: AuditEventType = row
            .event_type
            .parse()
            .map_err(|e| DbError::Corrupt(format!("audit entry {}: {e}", row.sequence_no)))?;
        Ok(AuditEntry {
            tenant_id: row.tenant_id,
            sequence_no: row.sequence_no,
            event_type,
            subject_id: row.subject_id,
            prev_hash: digest_from_hex(&row.prev_hash, "prev_hash", row.sequence_no)?,
            this_hash: digest_from_hex(&row.this_hash, "this_hash", row.sequence_no)?,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

const CHAIN_COLUMNS: &str =
    "tenant_id, sequence_no, event_type, subject_id, payload, prev_hash, this_hash, created_at";

pub async fn insert_entry<'e, E>(executor: E, entry: &AuditEntry) -> Result<(), DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    sqlx::query(
        "INSERT INTO audit_chain (tenant_id, sequence_no, event_type, subject_id, payload, prev_hash, this_hash, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(entry.tenant_id)
    .bind(entry.sequence_no)
    .bind(entry.event_type.as_str())
    .bind(entry.subject_id)
    .bind(entry.payload.as_str())
    .bind(hex::encode(entry.prev_hash))
    .bind(hex::encode(entry.this_hash))
    .bind(datetime_to_db_text(entry.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

/// Highest-sequence entry of a tenant's chain.
pub async fn get_tail<'e, E>(executor: E, tenant_id: i64) -> Result<Option<AuditEntry>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query_as::<_, AuditChainRow>(&format!(
        "SELECT {CHAIN_COLUMNS} FROM audit_chain
         WHERE tenant_id = $1
         ORDER BY sequence_no DESC
         LIMIT 1"
    ))
    .bind(tenant_id)
    .fetch_optional(executor)
    .await?;
    row.map(AuditEntry::try_from).transpose()
}

pub async fn get_entry(
    pool: &DbPool,
    tenant_id: i64,
    sequence_no: i64,
) -> Result<Option<AuditEntry>, DbError> {
    let row = sqlx::query_as::<_, AuditChainRow>(&format!(
        "SELECT {CHAIN_COLUMNS} FROM audit_chain WHERE tenant_id = $1 AND sequence_no = $2"
    ))
    .bind(tenant_id)
    .bind(sequence_no)
    .fetch_optional(pool)
    .await?;
    row.map(AuditEntry::try_from).transpose()
}

/// Entries with `from_seq <= sequence_no <= to_seq`, ascending.
pub async fn list_range(
    pool: &DbPool,
    tenant_id: i64,
    from_seq: i64,
    to_seq: i64,
    limit: i64,
) -> Result<Vec<AuditEntry>, DbError> {
    let rows = sqlx::query_as::<_, AuditChainRow>(&format!(
        "SELECT {CHAIN_COLUMNS} FROM audit_chain
         WHERE tenant_id = $1 AND sequence_no >= $2 AND sequence_no <= $3
         ORDER BY sequence_no
         LIMIT $4"
    ))
    .bind(tenant_id)
    .bind(from_seq)
    .bind(to_seq)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(AuditEntry::try_from).collect()
}

pub async fn list_for_subject(
    pool: &DbPool,
    tenant_id: i64,
    subject_id: i64,
) -> Result<Vec<AuditEntry>, DbError> {
    let rows = sqlx::query_as::<_, AuditChainRow>(&format!(
        "SELECT {CHAIN_COLUMNS} FROM audit_chain
         WHERE tenant_id = $1 AND subject_id = $2
         ORDER BY sequence_no"
    ))
    .bind(tenant_id)
    .bind(subject_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(AuditEntry::try_from).collect()
}

/// Record a break. The first break recorded for a tenant is kept until it
/// is cleared; returns `false` when the tenant was already frozen.
pub async fn insert_freeze(
    pool: &DbPool,
    brk: &ChainBreak,
    frozen_at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO audit_chain_freezes (tenant_id, record_id, expected_hash, actual_hash, frozen_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (tenant_id) DO NOTHING",
    )
    .bind(brk.tenant_id)
    .bind(brk.record_id)
    .bind(brk.expected_hash.as_str())
    .bind(brk.actual_hash.as_str())
    .bind(datetime_to_db_text(frozen_at))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_freeze<'e, E>(executor: E, tenant_id: i64) -> Result<Option<ChainBreak>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query(
        "SELECT record_id, expected_hash, actual_hash FROM audit_chain_freezes WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(executor)
    .await?;
    row.map(|row| -> Result<ChainBreak, DbError> {
        Ok(ChainBreak {
            tenant_id,
            record_id: row.try_get("record_id")?,
            expected_hash: row.try_get("expected_hash")?,
            actual_hash: row.try_get("actual_hash")?,
        })
    })
    .transpose()
}

pub async fn delete_freeze(pool: &DbPool, tenant_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM audit_chain_freezes WHERE tenant_id = $1")
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
