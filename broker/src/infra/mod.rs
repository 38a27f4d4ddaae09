//! Infrastructure adapters for the application ports.

pub mod command_runner;
pub mod config;
pub mod fs_store;
pub mod http_repository;
pub mod memory;
pub mod valkey;
