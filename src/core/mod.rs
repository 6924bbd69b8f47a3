pub mod agent;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod orchestrator;
pub mod recovery;
pub mod scheduled;
pub mod store;
pub mod tasks;
pub mod terminal;

#[cfg(test)]
pub(crate) mod test_support;
