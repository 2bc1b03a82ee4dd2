pub mod metrics;
pub mod prompts;
pub mod roles;
pub mod runtime;
