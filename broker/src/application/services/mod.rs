pub mod catalog;
pub mod cleaner;
pub mod executor;
pub mod hooks;
pub mod intake;
pub mod metadata;
pub mod orchestrator;
pub mod repository;
pub mod savepoint;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
