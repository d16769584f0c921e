pub mod config;
pub mod error;
pub mod escalation;
pub mod events;
pub mod git;
pub mod graph;
pub mod lock;
pub mod log;
pub mod preflight;
pub mod scheduler;
pub mod summary;
pub mod supervisor;
pub mod types;
pub mod watchdog;
pub mod workspace;
