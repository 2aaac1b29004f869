//! # Tag Harvest
//!
//! Ingests transcription-platform export archives into a relational store and
//! links the annotations found in them to curated vocabularies.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐
//! │ Archive  │──▶│ Reconcile │──▶│  Parse  │──▶│   Tags   │
//! │ (zip)    │   │ docs/pages│   │ PAGE XML│   │ + resolve│
//! └──────────┘   └───────────┘   └─────────┘   └────┬─────┘
//!                                                   │
//!                      ┌────────────────────────────┤
//!                      ▼                            ▼
//!                 ┌──────────┐                ┌──────────┐
//!                 │   CLI    │                │   HTTP   │
//!                 │(harvest) │                │  (jobs)  │
//!                 └──────────┘                └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init
//! harvest dict import places.json
//! harvest project load project.toml
//! harvest extract 1 --user alice
//! harvest stats 1
//! harvest suggest 42
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`projects`] | Project and dictionary inputs |
//! | [`archive`] | Export archive extraction |
//! | [`page_meta`] | Page and document metadata reading |
//! | [`reconcile`] | Document/page reconciliation |
//! | [`page_parser`] | PAGE XML structural parsing |
//! | [`tags`] | Tag extraction |
//! | [`resolve`] | Exact and fuzzy tag resolution |
//! | [`progress`] | Stage-weighted progress reporting |
//! | [`jobs`] | Job records, leases, cancellation |
//! | [`pipeline`] | Stage orchestration |
//! | [`stats`] | Project statistics |
//! | [`show`] | Document review output |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod page_meta;
pub mod page_parser;
pub mod pipeline;
pub mod progress;
pub mod projects;
pub mod reconcile;
pub mod resolve;
pub mod server;
pub mod show;
pub mod stats;
pub mod tags;
