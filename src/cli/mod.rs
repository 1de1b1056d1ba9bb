//! CLI module for the confidential RFQ binary

pub mod app;
pub mod commands;

pub use app::{derive_descriptor, keygen, DemoParams, DemoReport, OtcApp};
pub use commands::{Cli, Commands, SideArg};
