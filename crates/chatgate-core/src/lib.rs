//! Request orchestration for the gateway: API-key auth, session
//! matching, the generate executor, the model alias table, and the
//! maintenance loop.
//!
//! Everything here is an explicit object constructed at boot and handed
//! to the router; there is no implicit process-wide state.

pub mod auth;
pub mod error;
pub mod executor;
pub mod maintenance;
pub mod models;
pub mod session;
pub mod tokens;

pub use auth::{ApiKeyAuth, AuthContext};
pub use error::GatewayError;
pub use executor::{ChunkSender, GenerateInput, RequestExecutor};
pub use maintenance::Maintenance;
pub use models::ModelTable;
pub use session::{Fingerprints, MatchKind, MatchedSession, SessionMatcher, fingerprints};
pub use tokens::estimate_tokens;
