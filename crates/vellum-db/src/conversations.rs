use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;
use vellum_models::conversation::{Conversation, ConversationStatus, ConversationType};

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub tenant_id: i64,
    pub conversation_type: String,
    pub status: String,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ConversationRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let last_message_at_raw: Option<String> = row.try_get("last_message_at")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            conversation_type: row.try_get("conversation_type")?,
            status: row.try_get("status")?,
            message_count: row.try_get("message_count")?,
            last_message_at: last_message_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            created_by: row.try_get("created_by")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl ConversationRow {
    pub fn status(&self) -> Result<ConversationStatus, DbError> {
        self.status
            .parse()
            .map_err(|e| DbError::Corrupt(format!("conversation {}: {e}", self.id)))
    }

    /// Combine with the participant list into the domain entity.
    pub fn into_conversation(self, mut participant_ids: Vec<i64>) -> Result<Conversation, DbError> {
        let conversation_type: ConversationType = self
            .conversation_type
            .parse()
            .map_err(|e| DbError::Corrupt(format!("conversation {}: {e}", self.id)))?;
        let status = self.status()?;
        participant_ids.sort_unstable();
        participant_ids.dedup();
        Ok(Conversation {
            id: self.id,
            tenant_id: self.tenant_id,
            conversation_type,
            status,
            participant_ids,
            message_count: self.message_count,
            last_message_at: self.last_message_at,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}

const CONVERSATION_COLUMNS: &str =
    "id, tenant_id, conversation_type, status, message_count, last_message_at, created_by, created_at";

#[allow(clippy::too_many_arguments)]
pub async fn create_conversation<'e, E>(
    executor: E,
    id: i64,
    tenant_id: i64,
    conversation_type: ConversationType,
    created_by: i64,
    created_at: DateTime<Utc>,
    direct_key: Option<&str>,
) -> Result<ConversationRow, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "INSERT INTO conversations (id, tenant_id, conversation_type, status, message_count, created_by, created_at, direct_key)
         VALUES ($1, $2, $3, 'active', 0, $4, $5, $6)
         RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(id)
    .bind(tenant_id)
    .bind(conversation_type.as_str())
    .bind(created_by)
    .bind(datetime_to_db_text(created_at))
    .bind(direct_key)
    .fetch_one(executor)
    .await?;
    Ok(row)
}

pub async fn add_participant<'e, E>(
    executor: E,
    conversation_id: i64,
    user_id: i64,
    joined_at: DateTime<Utc>,
) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (conversation_id, user_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(datetime_to_db_text(joined_at))
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_participant<'e, E>(
    executor: E,
    conversation_id: i64,
    user_id: i64,
) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "DELETE FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_conversation<'e, E>(
    executor: E,
    id: i64,
) -> Result<Option<ConversationRow>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn get_participant_ids<'e, E>(
    executor: E,
    conversation_id: i64,
) -> Result<Vec<i64>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = $1
         ORDER BY user_id",
    )
    .bind(conversation_id)
    .fetch_all(executor)
    .await?;
    Ok(ids)
}

/// Load a conversation together with its participants.
pub async fn load_conversation(pool: &DbPool, id: i64) -> Result<Option<Conversation>, DbError> {
    let Some(row) = get_conversation(pool, id).await? else {
        return Ok(None);
    };
    let participants = get_participant_ids(pool, id).await?;
    row.into_conversation(participants).map(Some)
}

pub async fn find_direct_conversation<'e, E>(
    executor: E,
    tenant_id: i64,
    direct_key: &str,
) -> Result<Option<i64>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM conversations WHERE tenant_id = $1 AND direct_key = $2",
    )
    .bind(tenant_id)
    .bind(direct_key)
    .fetch_optional(executor)
    .await?;
    Ok(id)
}

/// Bump counters for an accepted message. An archived conversation becomes
/// active again.
pub async fn record_message<'e, E>(
    executor: E,
    conversation_id: i64,
    sent_at: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "UPDATE conversations
         SET message_count = message_count + 1,
             last_message_at = $2,
             status = CASE WHEN status = 'archived' THEN 'active' ELSE status END
         WHERE id = $1",
    )
    .bind(conversation_id)
    .bind(datetime_to_db_text(sent_at))
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Deleted conversations release their direct-pair slot so a new one can
/// be opened.
pub async fn set_status<'e, E>(
    executor: E,
    conversation_id: i64,
    status: ConversationStatus,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "UPDATE conversations
         SET status = $2,
             direct_key = CASE WHEN $2 = 'deleted' THEN NULL ELSE direct_key END
         WHERE id = $1",
    )
    .bind(conversation_id)
    .bind(status.as_str())
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Conversations whose last activity is older than `cutoff` and that are
/// not yet deleted.
pub async fn list_inactive(
    pool: &DbPool,
    tenant_id: i64,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ConversationRow>, DbError> {
    let rows = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE tenant_id = $1
           AND status <> 'deleted'
           AND COALESCE(last_message_at, created_at) < $2
         ORDER BY id
         LIMIT $3"
    ))
    .bind(tenant_id)
    .bind(datetime_to_db_text(cutoff))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_tenant_ids(pool: &DbPool) -> Result<Vec<i64>, DbError> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT tenant_id FROM conversations
         UNION
         SELECT tenant_id FROM retention_policies
         ORDER BY 1",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn list_user_conversation_ids(
    pool: &DbPool,
    tenant_id: i64,
    user_id: i64,
) -> Result<Vec<i64>, DbError> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT c.id FROM conversations c
         INNER JOIN conversation_participants p ON p.conversation_id = c.id
         WHERE c.tenant_id = $1 AND p.user_id = $2 AND c.status <> 'deleted'
         ORDER BY c.id",
    )
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
