pub mod assembler;
pub mod categories;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod parser;
pub mod runner;
pub mod selection;
pub mod settings;
pub mod tree;
