//! Pure domain logic. No I/O, no async runtime.

pub mod config;
pub mod credential;
pub mod error;
pub mod helm;
pub mod layout;
pub mod validate;
