//! Engine assembly: order executor, lifecycle supervisor, position audit,
//! and the handle exposed to external collaborators (dashboard, chat-bot).

mod audit;
mod executor;
mod handle;
mod supervisor;

pub use audit::run_position_audit;
pub use executor::OrderExecutor;
pub use handle::{EngineHandle, EngineSnapshot};
pub use supervisor::{CommandEnvelope, Supervisor};
