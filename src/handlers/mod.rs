// src/handlers/mod.rs
pub mod processing;
