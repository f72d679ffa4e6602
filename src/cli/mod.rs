//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - One-shot streaming generation
//! - The JSON-lines stdio bridge

pub mod commands;
pub mod handlers;

pub use commands::{Commands, GenerateCommand, ServeCommand};
pub use handlers::{handle_generate, handle_serve};
