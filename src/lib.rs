// src/lib.rs

// Import the top-level `selfevolve` module.
pub mod selfevolve;

// Re-export the submodules at the crate root so paths read as
// selfevolve::engine::SelfEvolve rather than selfevolve::selfevolve::engine::SelfEvolve.
pub use selfevolve::agent;
pub use selfevolve::broker;
pub use selfevolve::config;
pub use selfevolve::engine;
pub use selfevolve::evaluator;
pub use selfevolve::professor;
pub use selfevolve::prompts;
pub use selfevolve::provider;
pub use selfevolve::providers;
pub use selfevolve::refiner;
pub use selfevolve::runner;
pub use selfevolve::store;
pub use selfevolve::worker;

// Re-exporting key items for easier external access.
pub use selfevolve::agent::{Agent, AgentContext, AgentResult};
pub use selfevolve::engine::{Problem, SelfEvolve, Solution};
pub use selfevolve::provider::Provider;
