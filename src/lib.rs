//! Quiz-gated app access.
//!
//! The [`gate`] module holds the core: foreground observation, the per-app
//! access state machine, challenge launching, session timers and the block
//! overlay. [`commands`] wires it into the `quizlock` binary.

pub mod cli;
pub mod commands;
pub mod gate;
pub mod platform;
