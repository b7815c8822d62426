//! # Relate
//!
//! Discovers and classifies relationships between passages of different
//! books. Each book (a corpus) is split into passages and indexed with an
//! embedding oracle; every passage of one book is then matched against its
//! nearest neighbors in another, and a text-generation oracle decides how
//! each pair relates (supports, contradicts, extends, analogous).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Splitter │──▶│ Vector Index │──▶│  Candidate   │──▶│ Classifier │
//! │ (add)    │   │ (embeddings) │   │  Selector    │   │   (LLM)    │
//! └──────────┘   └──────┬───────┘   └──────────────┘   └─────┬──────┘
//!                       │                                    │
//!                       ▼                                    ▼
//!                 ┌───────────────────────────────────────────────┐
//!                 │ SQLite: corpora, passages, vectors, relations │
//!                 └───────────────────────────────────────────────┘
//! ```
//!
//! The pure pipeline lives in [`relate_core`]; this crate adds the
//! configuration, HTTP oracles, SQLite persistence, the orchestrator, and
//! the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! relate init
//! relate add origin.txt --title "On the Origin of Species"
//! relate add descent.txt --title "The Descent of Man" --auto
//! relate compare on-the-origin-of-species the-descent-of-man --threshold 0.6
//! relate relations on-the-origin-of-species
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite corpus, relation, and vector storage |
//! | [`oracle`] | HTTP retries and oracle deadlines |
//! | [`embedding`] | Embedding oracle providers |
//! | [`llm`] | Text-generation oracle providers |
//! | [`compare`] | Comparison orchestrator |
//! | [`progress`] | Progress events and reporters |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod compare;
pub mod config;
pub mod db;
pub mod embedding;
pub mod llm;
pub mod migrate;
pub mod oracle;
pub mod progress;
pub mod sqlite_store;
