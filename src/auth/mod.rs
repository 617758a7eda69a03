#![forbid(unsafe_code)]

// Auth module - bearer credential verification for the signaling upgrade

pub mod jwt;
pub mod types;

pub use jwt::authenticate;
pub use types::{AuthError, Claims};
