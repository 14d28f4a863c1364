pub mod evaluator;
pub mod loader;
pub mod types;
pub mod watch;
