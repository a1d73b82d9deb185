use crate::{bool_from_any_row, datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use sqlx::Row;
use vellum_models::message::{Message, SealedPayload};
use vellum_models::ANONYMOUS_USER_ID;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub tenant_id: i64,
    pub sender_id: i64,
    pub ciphertext: Option<String>,
    pub iv: Option<String>,
    pub tag: Option<String>,
    pub key_id: Option<String>,
    pub is_confidential: bool,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let sent_at_raw: String = row.try_get("sent_at")?;
        let edited_at_raw: Option<String> = row.try_get("edited_at")?;
        let deleted_at_raw: Option<String> = row.try_get("deleted_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            tenant_id: row.try_get("tenant_id")?,
            sender_id: row.try_get("sender_id")?,
            ciphertext: row.try_get("ciphertext")?,
            iv: row.try_get("iv")?,
            tag: row.try_get("tag")?,
            key_id: row.try_get("key_id")?,
            is_confidential: bool_from_any_row(row, "is_confidential")?,
            sent_at: datetime_from_db_text(&sent_at_raw)?,
            edited_at: edited_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            deleted_at: deleted_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
        })
    }
}

impl MessageRow {
    /// Decode the stored body columns. `None` for wiped bodies.
    pub fn sealed_payload(&self) -> Result<Option<SealedPayload>, DbError> {
        let (Some(ciphertext), Some(iv), Some(tag), Some(key_id)) =
            (&self.ciphertext, &self.iv, &self.tag, &self.key_id)
        else {
            return Ok(None);
        };
        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| DbError::Corrupt(format!("message {} {field}: {e}", self.id)))
        };
        let payload = SealedPayload::new(
            decode("ciphertext", ciphertext)?,
            &decode("iv", iv)?,
            &decode("tag", tag)?,
            key_id.clone(),
        )
        .map_err(|e| DbError::Corrupt(format!("message {}: {e}", self.id)))?;
        Ok(Some(payload))
    }

    pub fn into_message(self) -> Result<Message, DbError> {
        let body = self.sealed_payload()?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            tenant_id: self.tenant_id,
            sender_id: self.sender_id,
            body,
            is_confidential: self.is_confidential,
            sent_at: self.sent_at,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
        })
    }
}

/// Base64 text of each sealed component, as bound into the body columns.
struct EncodedBody {
    ciphertext: String,
    iv: String,
    tag: String,
    key_id: String,
}

impl From<&SealedPayload> for EncodedBody {
    fn from(payload: &SealedPayload) -> Self {
        Self {
            ciphertext: STANDARD.encode(payload.ciphertext()),
            iv: STANDARD.encode(payload.iv()),
            tag: STANDARD.encode(payload.tag()),
            key_id: payload.key_id().to_string(),
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, tenant_id, sender_id, ciphertext, iv, tag, key_id, \
     CASE WHEN is_confidential THEN 1 ELSE 0 END AS is_confidential, sent_at, edited_at, deleted_at";

#[allow(clippy::too_many_arguments)]
pub async fn create_message<'e, E>(
    executor: E,
    id: i64,
    conversation_id: i64,
    tenant_id: i64,
    sender_id: i64,
    body: &SealedPayload,
    is_confidential: bool,
    sent_at: DateTime<Utc>,
) -> Result<MessageRow, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let encoded = EncodedBody::from(body);
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "INSERT INTO messages (id, conversation_id, tenant_id, sender_id, ciphertext, iv, tag, key_id, is_confidential, sent_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(id)
    .bind(conversation_id)
    .bind(tenant_id)
    .bind(sender_id)
    .bind(encoded.ciphertext)
    .bind(encoded.iv)
    .bind(encoded.tag)
    .bind(encoded.key_id)
    .bind(is_confidential)
    .bind(datetime_to_db_text(sent_at))
    .fetch_one(executor)
    .await?;
    Ok(row)
}

pub async fn get_message<'e, E>(executor: E, id: i64) -> Result<Option<MessageRow>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Replace the body of a live message with a freshly sealed one.
pub async fn update_body<'e, E>(
    executor: E,
    id: i64,
    body: &SealedPayload,
    edited_at: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let encoded = EncodedBody::from(body);
    let result = sqlx::query(
        "UPDATE messages
         SET ciphertext = $2, iv = $3, tag = $4, key_id = $5, edited_at = $6
         WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(encoded.ciphertext)
    .bind(encoded.iv)
    .bind(encoded.tag)
    .bind(encoded.key_id)
    .bind(datetime_to_db_text(edited_at))
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Wipe the body and stamp `deleted_at`. The row stays as a tombstone.
/// Returns `false` when the message is missing or already tombstoned.
pub async fn tombstone<'e, E>(
    executor: E,
    id: i64,
    deleted_at: DateTime<Utc>,
) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "UPDATE messages
         SET ciphertext = NULL, iv = NULL, tag = NULL, key_id = NULL, deleted_at = $2
         WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(datetime_to_db_text(deleted_at))
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Tombstone and detach the message from its sender. Rows that are already
/// anonymous tombstones are left alone and reported as `false`.
pub async fn anonymize<'e, E>(
    executor: E,
    id: i64,
    deleted_at: DateTime<Utc>,
) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query(
        "UPDATE messages
         SET ciphertext = NULL, iv = NULL, tag = NULL, key_id = NULL,
             sender_id = $2,
             deleted_at = COALESCE(deleted_at, $3)
         WHERE id = $1 AND (deleted_at IS NULL OR sender_id <> $2)",
    )
    .bind(id)
    .bind(ANONYMOUS_USER_ID)
    .bind(datetime_to_db_text(deleted_at))
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Returns `false` when the row was already gone.
pub async fn hard_delete<'e, E>(executor: E, id: i64) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let result = sqlx::query("DELETE FROM messages WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// One page of history in ascending `(sent_at, id)` order, ending just
/// before `before` when given.
pub async fn get_conversation_messages(
    pool: &DbPool,
    conversation_id: i64,
    before: Option<i64>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let anchor = match before {
        Some(before_id) => match get_message(pool, before_id).await? {
            Some(row) if row.conversation_id == conversation_id => Some(row),
            _ => return Ok(Vec::new()),
        },
        None => None,
    };

    let mut rows = match anchor {
        Some(anchor) => {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = $1
                   AND (sent_at < $2 OR (sent_at = $2 AND id < $3))
                 ORDER BY sent_at DESC, id DESC
                 LIMIT $4"
            ))
            .bind(conversation_id)
            .bind(datetime_to_db_text(anchor.sent_at))
            .bind(anchor.id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = $1
                 ORDER BY sent_at DESC, id DESC
                 LIMIT $2"
            ))
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.reverse();
    Ok(rows)
}

/// Highest message id in the conversation, tombstones included.
pub async fn latest_message_id<'e, E>(
    executor: E,
    conversation_id: i64,
) -> Result<Option<i64>, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let id: Option<i64> =
        sqlx::query_scalar("SELECT MAX(id) FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(executor)
            .await?;
    Ok(id)
}

/// Live messages from other senders with an id in `(after_id, up_to_id]`.
pub async fn count_unread<'e, E>(
    executor: E,
    conversation_id: i64,
    user_id: i64,
    after_id: i64,
    up_to_id: i64,
) -> Result<i64, DbError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = $1
           AND id > $2 AND id <= $3
           AND sender_id <> $4
           AND deleted_at IS NULL",
    )
    .bind(conversation_id)
    .bind(after_id)
    .bind(up_to_id)
    .bind(user_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

/// Messages of a tenant sent before `cutoff`, in id order after `after_id`.
pub async fn list_expired(
    pool: &DbPool,
    tenant_id: i64,
    cutoff: DateTime<Utc>,
    after_id: i64,
    include_tombstones: bool,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let tombstone_filter = if include_tombstones {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE tenant_id = $1 AND sent_at < $2 AND id > $3 {tombstone_filter}
         ORDER BY id
         LIMIT $4"
    ))
    .bind(tenant_id)
    .bind(datetime_to_db_text(cutoff))
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Messages a user sent within a tenant, in id order after `after_id`.
pub async fn list_by_sender(
    pool: &DbPool,
    tenant_id: i64,
    sender_id: i64,
    after_id: i64,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE tenant_id = $1 AND sender_id = $2 AND id > $3
         ORDER BY id
         LIMIT $4"
    ))
    .bind(tenant_id)
    .bind(sender_id)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations;
    use crate::test_support::memory_pool;
    use chrono::Duration;
    use vellum_models::conversation::ConversationType;

    fn sealed(tag_byte: u8) -> SealedPayload {
        SealedPayload::new(vec![1, 2, 3], &[7u8; 12], &[tag_byte; 16], "k1").unwrap()
    }

    async fn seeded_pool() -> DbPool {
        let pool = memory_pool().await;
        conversations::create_conversation(&pool, 1, 1, ConversationType::Group, 10, Utc::now(), None)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn body_survives_storage() {
        let pool = seeded_pool().await;
        let now = vellum_util::time::truncate_micros(Utc::now());
        create_message(&pool, 100, 1, 1, 10, &sealed(9), true, now)
            .await
            .unwrap();
        let msg = get_message(&pool, 100)
            .await
            .unwrap()
            .unwrap()
            .into_message()
            .unwrap();
        assert_eq!(msg.body, Some(sealed(9)));
        assert!(msg.is_confidential);
        assert_eq!(msg.sent_at, now);
    }

    #[tokio::test]
    async fn tombstone_wipes_body() {
        let pool = seeded_pool().await;
        create_message(&pool, 100, 1, 1, 10, &sealed(1), false, Utc::now())
            .await
            .unwrap();
        assert!(tombstone(&pool, 100, Utc::now()).await.unwrap());
        assert!(!tombstone(&pool, 100, Utc::now()).await.unwrap());
        let msg = get_message(&pool, 100)
            .await
            .unwrap()
            .unwrap()
            .into_message()
            .unwrap();
        assert!(msg.body.is_none());
        assert!(msg.is_deleted());
        assert!(update_body(&pool, 100, &sealed(2), Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn anonymize_replaces_sender() {
        let pool = seeded_pool().await;
        create_message(&pool, 100, 1, 1, 10, &sealed(1), false, Utc::now())
            .await
            .unwrap();
        assert!(anonymize(&pool, 100, Utc::now()).await.unwrap());
        let row = get_message(&pool, 100).await.unwrap().unwrap();
        assert_eq!(row.sender_id, ANONYMOUS_USER_ID);
        assert!(row.ciphertext.is_none());
        assert!(row.deleted_at.is_some());

        assert!(!anonymize(&pool, 100, Utc::now()).await.unwrap());
        assert!(hard_delete(&pool, 100).await.unwrap());
        assert!(!hard_delete(&pool, 100).await.unwrap());
    }

    #[tokio::test]
    async fn history_is_ascending_and_pages_backwards() {
        let pool = seeded_pool().await;
        let base = Utc::now();
        // Same timestamp for 101/102: ties break on id.
        create_message(&pool, 101, 1, 1, 10, &sealed(1), false, base).await.unwrap();
        create_message(&pool, 102, 1, 1, 10, &sealed(1), false, base).await.unwrap();
        create_message(&pool, 103, 1, 1, 10, &sealed(1), false, base + Duration::seconds(1))
            .await
            .unwrap();

        let all = get_conversation_messages(&pool, 1, None, 50).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![101, 102, 103]);

        let page = get_conversation_messages(&pool, 1, Some(103), 1).await.unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![102]);
    }

    #[tokio::test]
    async fn unread_count_skips_own_and_deleted() {
        let pool = seeded_pool().await;
        let now = Utc::now();
        create_message(&pool, 101, 1, 1, 10, &sealed(1), false, now).await.unwrap();
        create_message(&pool, 102, 1, 1, 11, &sealed(1), false, now).await.unwrap();
        create_message(&pool, 103, 1, 1, 11, &sealed(1), false, now).await.unwrap();
        tombstone(&pool, 103, now).await.unwrap();

        let latest = latest_message_id(&pool, 1).await.unwrap().unwrap();
        assert_eq!(latest, 103);
        assert_eq!(count_unread(&pool, 1, 10, 0, latest).await.unwrap(), 1);
        assert_eq!(count_unread(&pool, 1, 11, 0, latest).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_listing_respects_cutoff_and_cursor() {
        let pool = seeded_pool().await;
        let old = Utc::now() - Duration::days(100);
        create_message(&pool, 101, 1, 1, 10, &sealed(1), false, old).await.unwrap();
        create_message(&pool, 102, 1, 1, 10, &sealed(1), false, old).await.unwrap();
        create_message(&pool, 103, 1, 1, 10, &sealed(1), false, Utc::now()).await.unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        let first = list_expired(&pool, 1, cutoff, 0, false, 1).await.unwrap();
        assert_eq!(first[0].id, 101);
        let rest = list_expired(&pool, 1, cutoff, 101, false, 10).await.unwrap();
        assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), vec![102]);
    }
}
