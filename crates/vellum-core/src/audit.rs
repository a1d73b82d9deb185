use crate::error::CoreError;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use vellum_db::DbPool;
use vellum_models::audit::{AuditEntry, AuditEventType, ChainBreak, Digest};
use vellum_models::TenantId;
use vellum_util::time::TimeSource;

const GENESIS_DOMAIN: &[u8] = b"vellum.audit.genesis";
const VERIFY_BATCH: i64 = 500;

/// `prev_hash` of a tenant's first entry.
pub fn genesis_hash(tenant_id: TenantId) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(GENESIS_DOMAIN);
    hasher.update(tenant_id.to_be_bytes());
    hasher.finalize().into()
}

/// Deterministic JSON text: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(key.clone()).to_string());
                    out.push(':');
                    write(&map[key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Canonical bytes of an event: length-prefixed type, big-endian subject,
/// length-prefixed payload, big-endian microsecond timestamp.
pub fn canonical_event_bytes(
    event_type: AuditEventType,
    subject_id: i64,
    payload: &str,
    created_at_micros: i64,
) -> Vec<u8> {
    let kind = event_type.as_str().as_bytes();
    let mut out = Vec::with_capacity(4 + kind.len() + 8 + 4 + payload.len() + 8);
    out.extend_from_slice(&(kind.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(&subject_id.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(&created_at_micros.to_be_bytes());
    out
}

/// `H(prev_hash ‖ canonical_event_bytes)` for a stored or staged entry.
pub fn entry_hash(entry: &AuditEntry) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(entry.prev_hash);
    hasher.update(canonical_event_bytes(
        entry.event_type,
        entry.subject_id,
        &entry.payload,
        entry.created_at.timestamp_micros(),
    ));
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy)]
struct ChainTail {
    next_seq: i64,
    tail_hash: Digest,
}

/// Per-tenant append-only hash chain.
///
/// Each tenant has one async mutex serialising the writers of this process.
/// Every writer (message store, retention sweep) holds the tenant's
/// [`TenantChainGuard`] across the database transaction that records both
/// the mutation and its chain entry. The tail is read inside that
/// transaction, so entries written by another process sharing the database
/// are picked up, and a racing fork fails on the `(tenant_id, sequence_no)`
/// key instead of being committed.
///
/// A detected break is stored in `audit_chain_freezes`. Every process
/// refuses to append for that tenant until an operator clears it.
pub struct AuditChain {
    pool: DbPool,
    writers: DashMap<TenantId, Arc<Mutex<()>>>,
    clock: Arc<dyn TimeSource>,
}

impl AuditChain {
    pub fn new(pool: DbPool, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            pool,
            writers: DashMap::new(),
            clock,
        }
    }

    pub async fn frozen_reason(&self, tenant_id: TenantId) -> Result<Option<ChainBreak>, CoreError> {
        Ok(vellum_db::audit_chain::get_freeze(&self.pool, tenant_id).await?)
    }

    pub async fn is_frozen(&self, tenant_id: TenantId) -> Result<bool, CoreError> {
        Ok(self.frozen_reason(tenant_id).await?.is_some())
    }

    /// Fail fast before doing work that would end in an append.
    pub async fn ensure_writable(&self, tenant_id: TenantId) -> Result<(), CoreError> {
        if self.is_frozen(tenant_id).await? {
            return Err(CoreError::ChainFrozen(tenant_id));
        }
        Ok(())
    }

    /// Take the tenant's writer lock. Call before opening the transaction
    /// the guard will append into.
    pub async fn lock_tenant(&self, tenant_id: TenantId) -> Result<TenantChainGuard, CoreError> {
        self.ensure_writable(tenant_id).await?;
        let writer = self
            .writers
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let writer = writer.lock_owned().await;

        Ok(TenantChainGuard {
            tenant_id,
            staged: None,
            _writer: writer,
            clock: self.clock.clone(),
        })
    }

    /// Append a single entry in its own transaction.
    pub async fn append(
        &self,
        tenant_id: TenantId,
        event_type: AuditEventType,
        subject_id: i64,
        payload: &Value,
    ) -> Result<AuditEntry, CoreError> {
        let mut guard = self.lock_tenant(tenant_id).await?;
        let mut tx = self.pool.begin().await?;
        let entry = guard
            .append(&mut tx, event_type, subject_id, payload)
            .await?;
        guard.commit(tx).await?;
        Ok(entry)
    }

    /// Recompute every hash in `from_seq..=to_seq` (to the tip when `to_seq`
    /// is `None`). Returns the number of entries checked.
    ///
    /// On the first mismatch the tenant is frozen in storage and an alert is
    /// logged; appends fail with `ChainFrozen` until [`AuditChain::unfreeze`].
    pub async fn verify(
        &self,
        tenant_id: TenantId,
        from_seq: i64,
        to_seq: Option<i64>,
    ) -> Result<u64, CoreError> {
        let from_seq = from_seq.max(0);
        let to_seq = to_seq.unwrap_or(i64::MAX);
        if to_seq < from_seq {
            return Err(CoreError::BadRequest("empty verification range".into()));
        }

        let mut expected_prev = if from_seq == 0 {
            genesis_hash(tenant_id)
        } else {
            match vellum_db::audit_chain::get_entry(&self.pool, tenant_id, from_seq - 1).await? {
                Some(prev) => {
                    let recomputed = entry_hash(&prev);
                    if recomputed != prev.this_hash {
                        return Err(self
                            .freeze(tenant_id, from_seq - 1, recomputed, prev.this_hash)
                            .await);
                    }
                    prev.this_hash
                }
                None => {
                    return Err(self.freeze_missing(tenant_id, from_seq - 1).await);
                }
            }
        };

        let mut expected_seq = from_seq;
        let mut checked = 0u64;
        loop {
            let batch = vellum_db::audit_chain::list_range(
                &self.pool,
                tenant_id,
                expected_seq,
                to_seq,
                VERIFY_BATCH,
            )
            .await?;
            let batch_len = batch.len();

            for entry in batch {
                if entry.sequence_no != expected_seq {
                    return Err(self.freeze_missing(tenant_id, expected_seq).await);
                }
                if entry.prev_hash != expected_prev {
                    return Err(self
                        .freeze(tenant_id, entry.sequence_no, expected_prev, entry.prev_hash)
                        .await);
                }
                let recomputed = entry_hash(&entry);
                if recomputed != entry.this_hash {
                    return Err(self
                        .freeze(tenant_id, entry.sequence_no, recomputed, entry.this_hash)
                        .await);
                }
                expected_prev = entry.this_hash;
                expected_seq += 1;
                checked += 1;
            }

            if (batch_len as i64) < VERIFY_BATCH || expected_seq > to_seq {
                break;
            }
        }

        tracing::info!(tenant_id, from_seq, checked, "audit chain verified");
        Ok(checked)
    }

    async fn freeze(
        &self,
        tenant_id: TenantId,
        record_id: i64,
        expected: Digest,
        actual: Digest,
    ) -> CoreError {
        self.freeze_with(ChainBreak {
            tenant_id,
            record_id,
            expected_hash: hex::encode(expected),
            actual_hash: hex::encode(actual),
        })
        .await
    }

    async fn freeze_missing(&self, tenant_id: TenantId, record_id: i64) -> CoreError {
        self.freeze_with(ChainBreak {
            tenant_id,
            record_id,
            expected_hash: "entry present".into(),
            actual_hash: "missing".into(),
        })
        .await
    }

    async fn freeze_with(&self, brk: ChainBreak) -> CoreError {
        tracing::error!(
            target: "vellum::alert",
            tenant_id = brk.tenant_id,
            record_id = brk.record_id,
            expected_hash = %brk.expected_hash,
            actual_hash = %brk.actual_hash,
            "audit chain broken; tenant frozen"
        );
        if let Err(err) =
            vellum_db::audit_chain::insert_freeze(&self.pool, &brk, self.clock.now()).await
        {
            tracing::error!(
                target: "vellum::alert",
                tenant_id = brk.tenant_id,
                error = %err,
                "failed to record audit chain freeze"
            );
        }
        CoreError::Integrity(brk)
    }

    /// Operator action after an investigation. Returns `false` when the
    /// tenant was not frozen.
    pub async fn unfreeze(&self, tenant_id: TenantId) -> Result<bool, CoreError> {
        let was_frozen = vellum_db::audit_chain::delete_freeze(&self.pool, tenant_id).await?;
        if was_frozen {
            tracing::warn!(tenant_id, "audit chain unfrozen by operator");
        }
        Ok(was_frozen)
    }

    /// Up to `limit` entries starting at `from_seq`, for export.
    pub async fn entries(
        &self,
        tenant_id: TenantId,
        from_seq: i64,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        Ok(vellum_db::audit_chain::list_range(
            &self.pool,
            tenant_id,
            from_seq.max(0),
            i64::MAX,
            limit.clamp(1, 1000),
        )
        .await?)
    }

    pub async fn entries_for_subject(
        &self,
        tenant_id: TenantId,
        subject_id: i64,
    ) -> Result<Vec<AuditEntry>, CoreError> {
        Ok(vellum_db::audit_chain::list_for_subject(&self.pool, tenant_id, subject_id).await?)
    }
}

/// Exclusive writer handle for one tenant's chain.
///
/// The first append reads the freeze marker and the tail through the open
/// transaction; later appends continue from the staged tail. Dropping the
/// guard without committing rolls everything back with the transaction.
pub struct TenantChainGuard {
    tenant_id: TenantId,
    staged: Option<ChainTail>,
    _writer: OwnedMutexGuard<()>,
    clock: Arc<dyn TimeSource>,
}

impl TenantChainGuard {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn load_tail(&self, conn: &mut sqlx::AnyConnection) -> Result<ChainTail, CoreError> {
        if vellum_db::audit_chain::get_freeze(&mut *conn, self.tenant_id)
            .await?
            .is_some()
        {
            return Err(CoreError::ChainFrozen(self.tenant_id));
        }
        Ok(
            match vellum_db::audit_chain::get_tail(&mut *conn, self.tenant_id).await? {
                Some(entry) => ChainTail {
                    next_seq: entry.sequence_no + 1,
                    tail_hash: entry.this_hash,
                },
                None => ChainTail {
                    next_seq: 0,
                    tail_hash: genesis_hash(self.tenant_id),
                },
            },
        )
    }

    pub async fn append(
        &mut self,
        conn: &mut sqlx::AnyConnection,
        event_type: AuditEventType,
        subject_id: i64,
        payload: &Value,
    ) -> Result<AuditEntry, CoreError> {
        let tail = match self.staged {
            Some(tail) => tail,
            None => self.load_tail(conn).await?,
        };
        let mut entry = AuditEntry {
            tenant_id: self.tenant_id,
            sequence_no: tail.next_seq,
            event_type,
            subject_id,
            payload: canonical_json(payload),
            prev_hash: tail.tail_hash,
            this_hash: [0u8; 32],
            created_at: self.clock.now(),
        };
        entry.this_hash = entry_hash(&entry);

        vellum_db::audit_chain::insert_entry(&mut *conn, &entry).await?;

        self.staged = Some(ChainTail {
            next_seq: entry.sequence_no + 1,
            tail_hash: entry.this_hash,
        });
        Ok(entry)
    }

    pub async fn commit(self, tx: sqlx::Transaction<'_, sqlx::Any>) -> Result<(), CoreError> {
        tx.commit().await?;
        Ok(())
    }
}
