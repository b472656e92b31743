//! Public /v1beta router: model listing and unary/streaming generation,
//! with API-key auth and SSE bridging.

mod routes;

pub use routes::{GatewayContext, public_router};
