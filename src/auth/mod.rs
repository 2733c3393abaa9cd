//! Authentication: session tokens, roles and permissions.

mod manager;
mod permissions;
pub mod token;

pub use manager::{
  is_valid_email, validate_login, AuthManager, Credentials, LoginOutcome, SessionEvent,
};
pub use permissions::{Permission, Role};
