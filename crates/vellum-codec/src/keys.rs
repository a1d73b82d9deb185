// Symmetric key registry for message sealing.

use crate::CryptoError;
use dashmap::{DashMap, DashSet};
use hkdf::Hkdf;
use sha2::Sha256;
use vellum_models::TenantId;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

const HKDF_SALT: &[u8] = b"vellum.message.key";

/// Raw key bytes. Debug output never shows them.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(text.trim()).map_err(|_| CryptoError::InvalidKeyMaterial(0))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Source of key material by `key_id`, normally backed by the external
/// identity service.
pub trait KeyProvider: Send + Sync {
    /// Key bytes for `key_id`, or `None` once unknown or retired.
    fn resolve(&self, key_id: &str) -> Option<KeyMaterial>;

    /// Key id new records of `tenant_id` should be sealed with.
    fn active_key_id(&self, tenant_id: TenantId) -> Option<String>;
}

/// Derive the key for `key_id` from a master secret with HKDF-SHA256.
pub fn derive_tenant_key(master: &KeyMaterial, key_id: &str) -> Result<KeyMaterial, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), master.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(key_id.as_bytes(), &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(KeyMaterial(okm))
}

/// Key id of the `version`th derived key of a tenant, e.g. `t7-v2`.
pub fn derived_key_id(tenant_id: TenantId, version: u32) -> String {
    format!("t{tenant_id}-v{version}")
}

fn parse_derived_key_id(key_id: &str) -> Option<(TenantId, u32)> {
    let rest = key_id.strip_prefix('t')?;
    let (tenant, version) = rest.split_once("-v")?;
    Some((tenant.parse().ok()?, version.parse().ok()?))
}

/// In-memory `KeyProvider`.
///
/// Explicitly inserted keys always win. When built with a master secret,
/// tenants without an explicit key get `t<tenant>-v1` derived on first use,
/// and any `t<tenant>-v<n>` id can be re-derived for historical messages
/// until it is retired.
#[derive(Default)]
pub struct Keyring {
    keys: DashMap<String, KeyMaterial>,
    active: DashMap<TenantId, String>,
    retired: DashSet<String>,
    master: Option<KeyMaterial>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_master(master: KeyMaterial) -> Self {
        Self {
            master: Some(master),
            ..Self::default()
        }
    }

    /// Register a key without making it active for anyone.
    pub fn insert(&self, key_id: impl Into<String>, material: KeyMaterial) -> Result<(), CryptoError> {
        let key_id = key_id.into();
        vellum_util::validation::validate_key_id(&key_id)
            .map_err(|_| CryptoError::InvalidKeyId(key_id.clone()))?;
        self.retired.remove(&key_id);
        self.keys.insert(key_id, material);
        Ok(())
    }

    /// Make `key_id` the tenant's active key. Previous keys stay resolvable.
    pub fn rotate(
        &self,
        tenant_id: TenantId,
        key_id: impl Into<String>,
        material: KeyMaterial,
    ) -> Result<(), CryptoError> {
        let key_id = key_id.into();
        self.insert(key_id.clone(), material)?;
        let previous = self.active.insert(tenant_id, key_id.clone());
        tracing::info!(tenant_id, key_id = %key_id, previous = ?previous, "message key rotated");
        Ok(())
    }

    /// Advance a tenant to the next derived key version.
    pub fn rotate_derived(&self, tenant_id: TenantId) -> Result<String, CryptoError> {
        let master = self.master.as_ref().ok_or(CryptoError::NoActiveKey(tenant_id))?;
        let next_version = self
            .active_key_id(tenant_id)
            .and_then(|id| parse_derived_key_id(&id))
            .filter(|(tenant, _)| *tenant == tenant_id)
            .map(|(_, version)| version + 1)
            .unwrap_or(1);
        let key_id = derived_key_id(tenant_id, next_version);
        let material = derive_tenant_key(master, &key_id)?;
        self.rotate(tenant_id, key_id.clone(), material)?;
        Ok(key_id)
    }

    /// Make a key permanently unresolvable.
    pub fn retire(&self, key_id: &str) {
        self.keys.remove(key_id);
        self.retired.insert(key_id.to_string());
        self.active.retain(|_, active| active.as_str() != key_id);
        tracing::warn!(key_id, "message key retired");
    }
}

impl KeyProvider for Keyring {
    fn resolve(&self, key_id: &str) -> Option<KeyMaterial> {
        if self.retired.contains(key_id) {
            return None;
        }
        if let Some(material) = self.keys.get(key_id) {
            return Some(material.clone());
        }
        let master = self.master.as_ref()?;
        parse_derived_key_id(key_id)?;
        derive_tenant_key(master, key_id).ok()
    }

    fn active_key_id(&self, tenant_id: TenantId) -> Option<String> {
        if let Some(active) = self.active.get(&tenant_id) {
            return Some(active.clone());
        }
        self.master.as_ref()?;
        let key_id = derived_key_id(tenant_id, 1);
        if self.retired.contains(&key_id) {
            return None;
        }
        Some(
            self.active
                .entry(tenant_id)
                .or_insert(key_id)
                .value()
                .clone(),
        )
    }
}
