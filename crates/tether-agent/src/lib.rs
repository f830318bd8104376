//! Tether agent — library crate exposing the config module so tests
//! and external embedders can reuse it.

pub mod config;
