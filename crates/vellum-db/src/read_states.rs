use crate::{datetime_to_db_text, DbError};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReadStateRow {
    pub conversation_id: i64,
    pub user_id: i64,
    pub last_read_message_id: i64,
}

pub async fn get_read_state<'e, E>(
    executor: E,
    conversation_id: i64,
    user_id: i64,
) -> Result<Option<ReadStateRow>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query_as::<_, ReadStateRow>(
        "SELECT conversation_id, user_id, last_read_message_id
         FROM read_states WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn update_read_state<'e, E>(
    executor: E,
    conversation_id: i64,
    user_id: i64,
    last_read_message_id: i64,
    updated_at: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    sqlx::query(
        "INSERT INTO read_states (conversation_id, user_id, last_read_message_id, updated_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (conversation_id, user_id)
         DO UPDATE SET last_read_message_id = $3, updated_at = $4",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(last_read_message_id)
    .bind(datetime_to_db_text(updated_at))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_user_read_states<'e, E>(
    executor: E,
    tenant_id: i64,
    user_id: i64,
) -> Result<u64, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "DELETE FROM read_states
         WHERE user_id = $2
           AND conversation_id IN (SELECT id FROM conversations WHERE tenant_id = $1)",
    )
    .bind(tenant_id)
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
