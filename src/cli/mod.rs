//! Operator subcommands.

pub mod check;
pub mod rules;
pub mod status;
