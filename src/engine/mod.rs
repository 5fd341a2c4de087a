// Engine: session pool, cache, scheduling and fetch orchestration.

pub mod cache;
pub mod clock;
pub mod orchestrator;
pub mod randomizer;
pub mod scheduler;
pub mod session;
pub mod stats;
