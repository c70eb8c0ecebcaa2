pub mod assignment;
pub mod checkpoint;
pub mod conductor_config;
pub mod config;
pub mod context;
pub mod detect;
pub mod errors;
pub mod events;
pub mod executor;
pub mod lock;
pub mod pipeline;
pub mod plan;
pub mod recovery;
pub mod router;
pub mod session;
pub mod ui;
pub mod workflow;
