pub mod context;
pub mod coordinator;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod stream;

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod scenario_tests;
