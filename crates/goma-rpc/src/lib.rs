//! HTTP client and RPC task state machine (spec §3, §4.E): request/response
//! framing, compression negotiation, health/backoff accounting, OAuth2
//! token refresh, and the reactor-driven `Task` that ties them together.

pub mod compression;
pub mod error;
pub mod health;
pub mod oauth2;
pub mod request;
pub mod response;
pub mod task;

pub use compression::Encoding;
pub use error::RpcError;
pub use health::HealthState;
pub use oauth2::{OAuth2RefreshTask, RefreshConfig};
pub use request::{Body, HttpRequest, Method};
pub use response::HttpResponse;
pub use task::{CompletionFn, HttpClient, TaskState, ThrottleCounter};
