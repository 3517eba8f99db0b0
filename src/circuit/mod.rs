//! Circuit breaking for calls to downstream dependencies.

mod breaker;
mod registry;
mod state;

pub use breaker::{CircuitBreaker, FailureKind};
pub use registry::CircuitRegistry;
pub use state::{CircuitConfig, CircuitSnapshot, CircuitState, Phase};
