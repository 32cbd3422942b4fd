//! Client core for the LLM gateway.
//!
//! Provides an authenticated transport that retries transient failures once,
//! a stale-while-revalidate resource cache, single-flight profile resolution
//! and incremental chat reply streaming over SSE, NDJSON or whole replies.

pub mod admin;
pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod resolver;
pub mod storage;
pub mod stream;
pub mod transport;
pub mod types;

pub use cache::{CACHE_PREFIX, CachedResource, ResourceSnapshot};
pub use client::GatewayClient;
pub use config::{GatewayConfig, StreamConfig};
pub use error::{ClientError, STREAM_FAILURE_MESSAGE, SharedClientError};
pub use identity::{IdentityStore, Session, StorageScope};
pub use resolver::IdentityResolver;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use stream::{ChatStream, DeliveryMode, StreamLine, parse_stream_line};
pub use tokio_util::sync::CancellationToken;
pub use transport::{AuthenticatedTransport, HttpMethod, RequestOptions, SessionEvent};
pub use types::*;
