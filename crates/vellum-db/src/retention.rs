use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetentionPolicyRow {
    pub tenant_id: i64,
    pub message_days: i64,
    pub mode: String,
}

pub async fn get_policy(
    pool: &DbPool,
    tenant_id: i64,
) -> Result<Option<RetentionPolicyRow>, DbError> {
    let row = sqlx::query_as::<_, RetentionPolicyRow>(
        "SELECT tenant_id, message_days, mode FROM retention_policies WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn upsert_policy(
    pool: &DbPool,
    tenant_id: i64,
    message_days: i64,
    mode: &str,
    updated_at: DateTime<Utc>,
) -> Result<RetentionPolicyRow, DbError> {
    let row = sqlx::query_as::<_, RetentionPolicyRow>(
        "INSERT INTO retention_policies (tenant_id, message_days, mode, updated_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (tenant_id) DO UPDATE SET message_days = $2, mode = $3, updated_at = $4
         RETURNING tenant_id, message_days, mode",
    )
    .bind(tenant_id)
    .bind(message_days)
    .bind(mode)
    .bind(datetime_to_db_text(updated_at))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_policy(pool: &DbPool, tenant_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM retention_policies WHERE tenant_id = $1")
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Last message id a sweep of this tenant has fully processed.
pub async fn get_cursor(pool: &DbPool, tenant_id: i64) -> Result<i64, DbError> {
    let cursor: Option<i64> = sqlx::query_scalar(
        "SELECT last_message_id FROM retention_cursors WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    Ok(cursor.unwrap_or(0))
}

pub async fn set_cursor<'e, E>(
    executor: E,
    tenant_id: i64,
    last_message_id: i64,
    updated_at: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    sqlx::query(
        "INSERT INTO retention_cursors (tenant_id, last_message_id, updated_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (tenant_id) DO UPDATE SET last_message_id = $2, updated_at = $3",
    )
    .bind(tenant_id)
    .bind(last_message_id)
    .bind(datetime_to_db_text(updated_at))
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_pool;

    #[tokio::test]
    async fn policy_upsert_replaces_previous_values() {
        let pool = memory_pool().await;
        assert!(get_policy(&pool, 1).await.unwrap().is_none());
        upsert_policy(&pool, 1, 30, "delete", Utc::now()).await.unwrap();
        let row = upsert_policy(&pool, 1, 7, "anonymize", Utc::now()).await.unwrap();
        assert_eq!(row.message_days, 7);
        assert_eq!(row.mode, "anonymize");
        assert!(delete_policy(&pool, 1).await.unwrap());
    }

    #[tokio::test]
    async fn cursor_defaults_to_zero() {
        let pool = memory_pool().await;
        assert_eq!(get_cursor(&pool, 5).await.unwrap(), 0);
        set_cursor(&pool, 5, 1234, Utc::now()).await.unwrap();
        assert_eq!(get_cursor(&pool, 5).await.unwrap(), 1234);
    }
}
