//! Persistent store for providers, sessions, request logs and API keys.
//!
//! Runtime components depend on the [`Storage`] trait; the sea-orm
//! implementation is the only concrete backend. Provider credential blobs
//! are encrypted at rest by [`crypto::CredentialCipher`].

pub mod crypto;
pub mod entities;
mod seaorm;
mod storage;

pub use crypto::{CredentialCipher, CryptoError};
pub use seaorm::SeaOrmStorage;
pub use storage::{
    ApiKeyRecord, NewProvider, NewRequestLog, NewSession, ProviderRecord, ProviderStatus,
    SessionRecord, SessionStatus, Storage, StorageError, StorageResult,
};
