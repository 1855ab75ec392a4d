pub mod config;
pub mod dag;
pub mod fsutil;
pub mod git;
pub mod handover;
pub mod loop_state;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod template;
pub mod tokens;
pub mod types;

pub use types::*;
