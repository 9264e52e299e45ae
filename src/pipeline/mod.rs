//! Orchestration: the continuously-running processing loop and the
//! synchronized command surface exposed to external callers.

mod locks;
mod processor;
mod shared_state;
mod vision_system;

pub use locks::{CommandGuard, CommandLocks};
pub use shared_state::SharedState;
pub use vision_system::VisionSystem;
