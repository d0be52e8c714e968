pub mod comparison;
pub mod context;
pub mod executors;
pub mod input;
pub mod run_log;
pub mod scheduler;
pub mod session;

pub use comparison::{ComparisonCoordinator, DEFAULT_COMPARISON_LIMIT};
pub use context::{ModelDefaults, RuntimeContext};
pub use executors::{ExecutorRegistry, NodeExecutor, NodeOutput};
pub use input::ResolvedInput;
pub use run_log::RunLogger;
pub use scheduler::{order, order_graph};
pub use session::SessionRunner;
