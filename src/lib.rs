//! pod-decorator: inject Vault secrets and Consul configuration into a
//! wrapped process and keep its Vault lease alive while it runs.

pub mod backends;
pub mod cli;
pub mod config;
pub mod inject;
pub mod lease;
pub mod logging;
pub mod process;
pub mod runner;
