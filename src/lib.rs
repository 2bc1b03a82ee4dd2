pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod message;
pub mod orchestration;
pub mod streaming;
