//! Backend access: transport, interceptor, retries and typed resources.

pub mod client;
pub mod error;
pub mod resources;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::{with_cancel, ApiClient};
pub use error::{ApiError, ApiResult, ErrorKind};
pub use resources::{CacheTtls, EventQuery, FlockApi, MemberQuery, PledgeQuery, StatsPeriod};
pub use transport::{HttpBackend, ReqwestBackend, RequestSpec, Transport};
