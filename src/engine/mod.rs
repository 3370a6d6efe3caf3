// Source Engine Module
// Uniform access to relational and tool sources

pub mod drivers;
pub mod error;
pub mod executor;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use executor::{SourceCall, SourceExecutor};
pub use registry::{SourceRegistry, ToolRegistry};
pub use traits::{RelationalBackend, ToolInvoker};
pub use types::*;
