//! # Event Harvest
//!
//! Turns raw business files (CSV/XLSX tables, JSON alert streams, DOCX
//! reports) into structured business events with an LLM, and upserts them
//! into a remote table.
//!
//! Every file is first reduced to a bounded *evidence digest* (a facts sheet
//! for tables, an excerpt for documents, analytics for alert streams) so the
//! model sees a small, deterministic summary instead of the raw data. A Drive
//! sync machine can feed the pipeline from a watched folder.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │ Input file │──▶│  Digest  │──▶│ Extractor │──▶│  Pusher  │──▶ events table
//! │ csv/xlsx/  │   │ facts /  │   │  (LLM)    │   │ (upsert) │
//! │ json/docx  │   │ excerpt  │   └───────────┘   └──────────┘
//! └────────────┘   └──────────┘         ▲
//!       ▲                               │
//!  ┌────┴──────────────┐          ┌─────┴─────┐
//!  │ Drive sync machine│◀─────────│ HTTP / CLI│
//!  └───────────────────┘          └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest digest ./data/inputs/support_tickets.csv   # inspect a digest
//! harvest run-pipeline                                # extract + push
//! harvest serve                                       # Drive sync + HTTP
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Sources, events, extraction documents, rows |
//! | [`table`] | CSV / XLSX loading |
//! | [`facts`] | Column inference and facts sheets |
//! | [`alerts`] | Alert-stream analytics |
//! | [`extract`] | DOCX text extraction |
//! | [`digest`] | Evidence digest dispatch |
//! | [`llm`] | Chat model seam and OpenAI-compatible client |
//! | [`extractor`] | Extraction orchestration and event normalization |
//! | [`pusher`] | Batched upsert into a PostgREST table |
//! | [`progress`] | Progress reporting |
//! | [`drive`] | Drive provider seam and Google Drive client |
//! | [`state`] | Persisted sync state and stores |
//! | [`sync`] | Drive sync state machine |
//! | [`server`] | HTTP control surface |

pub mod alerts;
pub mod config;
pub mod digest;
pub mod drive;
pub mod error;
pub mod extract;
pub mod extractor;
pub mod facts;
pub mod http;
pub mod llm;
pub mod models;
pub mod progress;
pub mod pusher;
pub mod server;
pub mod state;
pub mod sync;
pub mod table;
