pub mod buffer;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod manager;
pub mod source;
pub mod task;
