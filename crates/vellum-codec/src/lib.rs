pub mod crypto;
pub mod keys;

pub use crypto::{CryptoCodec, CryptoError};
pub use keys::{derive_tenant_key, KeyMaterial, KeyProvider, Keyring};
