pub mod accounts;
pub mod app;
pub mod arbiter;
#[cfg(unix)]
pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod mappings;
pub mod paths;
pub mod pattern;
pub mod presence;
pub mod service;
#[cfg(test)]
pub mod test_support;
pub mod vault;
