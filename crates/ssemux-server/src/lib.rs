//! ssemux Server Library
//!
//! HTTP routing layer over the core session registry:
//! - session creation, attach (SSE body) and raw feed endpoints
//! - standalone keep-alive pulse stream
//! - health probe

pub mod routes;
