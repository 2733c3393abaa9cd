//! Data hooks: long-lived view-state holders fed by the API layer.

pub mod aggregate;
pub mod dashboard;
pub mod members;
pub mod metrics;
pub mod query;
pub mod recent;
pub mod reports;

pub use aggregate::{AggregateHook, AggregatedResult, AutoRefresh, Constituent, ConstituentError, LoadMode};
pub use dashboard::{DashboardData, DashboardHook};
pub use members::MembersListHook;
pub use metrics::Metrics;
pub use query::{Query, QueryState};
pub use recent::{RecentActivity, RecentActivityHook};
pub use reports::{ReportsData, ReportsHook};
