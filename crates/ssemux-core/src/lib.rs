//! `ssemux` Core Library
//!
//! Multiplexes output from many concurrent producers into one ordered
//! server-sent-event channel:
//! - FIFO async mutex with scoped release
//! - SSE frame codec and payload classification
//! - Stream sessions and the registry that owns them
//! - Heartbeat producer and keep-alive pulse
//! - Configuration resolution and common error types

pub mod codec;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod mutex;
pub mod pulse;
pub mod registry;
pub mod session;
pub mod source;
pub mod tracing_init;

pub use codec::{Chunk, Frame, Source, Variant};
pub use config::Config;
pub use error::{Error, Result};
pub use mutex::{FifoMutex, Lock};
pub use registry::{RegistryError, SessionRegistry};
pub use session::{EventStream, SessionState, StreamSession};
pub use source::{BodyHandle, ResponseSource};
