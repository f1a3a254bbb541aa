//! CLI command implementations

pub mod logs;
pub mod plugins;
pub mod run;
pub mod validate;
