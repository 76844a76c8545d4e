#![allow(clippy::needless_return)]

pub mod admin_tool;
mod args;

pub use args::{AdminToolArgs, AdminToolCommand, DefaultCommandLineArgs, SharedArgs, SubCommands};
