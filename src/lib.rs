//! farmtrack backend library.
//!
//! Exposes every module for the binary and the integration tests.

pub mod api;
pub mod config;
pub mod events;
pub mod items;
pub mod maps;
pub mod parsing;
pub mod prices;
pub mod services;
pub mod storage;
pub mod tailer;

pub use config::Config;
pub use events::EventBus;
pub use storage::Database;
