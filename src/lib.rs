pub mod cli;
pub mod config;
pub mod cryptography;
pub mod error;
pub mod filesystem;
pub mod sync;
pub mod vault;
