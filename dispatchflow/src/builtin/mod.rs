//! Actions shipped with the engine.
//!
//! Boot, deploy and test strategies live outside the engine and register
//! their kinds in the [`ActionRegistry`](crate::action::ActionRegistry);
//! these are the few actions every dispatcher needs regardless.

mod command;
mod finalize;
mod shell;

pub use command::CommandAction;
pub use finalize::{FinalizeAction, PowerOff, ReadFeedback, FEEDBACK_WINDOW};
pub use shell::{ConnectShell, RunShellCommands, ShellAction, DEFAULT_SHELL};
