pub mod auth;
pub mod error;
pub mod keys;
pub mod messages;
pub mod middleware;
