//! Load simulation against fake dependencies.
//!
//! # Data Flow
//! ```text
//! run_simulation (runner.rs)
//!     → PipelineSet (one pipeline per dependency, reloadable)
//!     → FlakyDependency (dependency.rs, seeded fault injection)
//!     → SimulationReport (text or JSON)
//! ```

pub mod dependency;
pub mod runner;

pub use dependency::{FaultProfile, FlakyDependency, SimError};
pub use runner::{run_simulation, DependencyReport, SharedPipelines, SimulationOptions, SimulationReport};
