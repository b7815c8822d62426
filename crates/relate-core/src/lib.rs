//! # Relate Core
//!
//! Runtime-free logic for relate: the passage data model, the error
//! taxonomy, the in-process vector index, candidate selection, relation
//! classification with its layered response parser, and full-context
//! corpus decomposition.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Embedding and text-generation oracles are reached through the traits in
//! [`embedding`] and [`classify`]; corpora are read through the traits in
//! [`store`]. The `relate` app crate supplies the concrete implementations.

pub mod classify;
pub mod decompose;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod parse;
pub mod select;
pub mod split;
pub mod store;

pub use error::{RelationError, Result};
