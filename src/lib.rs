pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod driver;
/// Orchestration entry points: `run_plan` and the per-target `Orchestrator`.
pub mod engine;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod outcome;
pub mod profile;
pub mod selector;
pub mod target;

#[cfg(test)]
mod test_support;

pub use catalog::{Stage, Technique, TechniqueCatalog};
pub use engine::{run_plan, Orchestrator};
pub use outcome::Outcome;
pub use profile::CapabilityProfile;
pub use selector::Plan;
