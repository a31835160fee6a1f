//! Colloquy worker process
//!
//! Binds the `coordination` library to the outside world: configuration from
//! the environment and a TOML file, HTTP turn-completion providers, the
//! knowledge pack file, and the command-line entry point.

pub mod app;
pub mod config;
pub mod knowledge;
pub mod providers;

pub use app::App;
pub use config::WorkerConfig;
