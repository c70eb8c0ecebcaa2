//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled           |
//! |-----------|----------------------------|
//! | `init`    | `Init`                     |
//! | `run`     | `Run`, `Resume`, `Decide`  |
//! | `status`  | `Status`                   |
//! | `session` | `Session`                  |
//! | `locks`   | `Locks`                    |
//! | `context` | `Context`                  |

pub mod context;
pub mod init;
pub mod locks;
pub mod run;
pub mod session;
pub mod status;

pub use context::cmd_context;
pub use init::cmd_init;
pub use locks::cmd_locks;
pub use run::{cmd_decide, cmd_resume, cmd_run};
pub use session::cmd_session;
pub use status::cmd_status;
