//! File and directory transfer over a shared, prefix-multiplexed UDP endpoint
//!
//! - [`tftp`]: The transfer engine, its wire format and transport adapters
//! - [`config`]: TOML configuration file for the command line tool

pub mod config;
pub mod tftp;
