//! Pipewright - Resumable Pipeline Orchestration Engine
//!
//! Drives a resolved plan graph node by node. Each node is handed to a step
//! implementation in the mode its facilitator picks; nodes that wait on
//! remote work, timers or child nodes are persisted as WAITING and resumed
//! by notification, so no thread is held while work happens elsewhere.
//! Advisers decide what follows each node, interrupts and timeouts inject
//! control actions, and barriers let parallel branches rendezvous.
//!
//! # Architecture
//!
//! - [`plan`]: Plans, nodes and the ambiance threaded through them
//! - [`execution`]: Node/plan execution records and the engine
//! - [`facilitator`]: Execution mode selection
//! - [`adviser`]: Next-action decisions
//! - [`interrupt`]: Control operations and timeouts
//! - [`waiter`]: Notification glue and the resume executor
//! - [`barrier`]: Forcer/proctor rendezvous
//! - [`steps`]: Built-in orchestration steps
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//!
//! use pipewright::execution::EngineBuilder;
//! use pipewright::waiter::spawn_executor;
//! use pipewright::{load_plan, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = EngineBuilder::new(EngineConfig::default()).build()?;
//!     let executor = spawn_executor(engine.clone())?;
//!
//!     let plan = load_plan("plan.yaml")?;
//!     let plan_id = plan.id.clone();
//!     engine.register_plan(plan)?;
//!
//!     let execution_id = engine.start_plan(&plan_id, HashMap::new())?;
//!     let status = engine.wait_for_plan(&execution_id).await?;
//!     println!("{} finished {}", execution_id, status);
//!
//!     executor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adviser;
pub mod barrier;
pub mod config;
pub mod execution;
pub mod facilitator;
pub mod interrupt;
pub mod monitoring;
pub mod plan;
pub mod steps;
pub mod waiter;

// Re-export commonly used types
pub use config::EngineConfig;
pub use execution::{Engine, EngineBuilder, EngineError, NodeExecution, Status};
pub use plan::{load_plan, Plan, PlanNode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Pipewright";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Pipewright");
    }

    #[test]
    fn test_module_exports_plan() {
        let plan = Plan::new("p", "start");
        assert!(plan.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
