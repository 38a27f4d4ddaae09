//! Integration tests for helm-broker
//!
//! Intake and workers run against a temporary config root, in-memory
//! substrate and a fake cluster standing in for helm and kubectl. Hook
//! scripts run under the real bash.

mod binding;
mod cli_tests;
mod concurrency;
mod hooks;
mod lifecycle;
mod support;
