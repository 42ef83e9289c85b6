//! Builders that wire the façade from configuration.

pub mod pathways_builder;

pub use pathways_builder::PathwaysBuilder;
