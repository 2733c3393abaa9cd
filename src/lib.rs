//! Client data layer for the Flock church membership, events and pledges API.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod hooks;
pub mod import;
pub mod logging;
pub mod offline;
pub mod storage;

pub use context::AppContext;
