//! # Librarian
//!
//! Serves codebase context from a prebuilt vector index that is published
//! elsewhere and swapped in without downtime.
//!
//! An external pipeline packs `manifest.json` and `index.sqlite` into a ZIP
//! archive and uploads it to object storage under
//! `indexes/{branch}/latest/{archive_name}`. Librarian fetches it, unpacks
//! it safely, checks the manifest against its own embedding model, loads
//! the vectors and atomically replaces the active generation. Queries are
//! embedded, searched, optionally reranked by a cross-encoder and cached.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Credentials │──▶│   Fetch     │──▶│ Unpack +      │──▶│ VectorIndex │
//! │ env/IMDS/   │   │ S3 / local │   │ Manifest +    │   │   Store     │
//! │ profile     │   │ + retry    │   │ Load          │   │ (ArcSwap)   │
//! └─────────────┘   └────────────┘   └──────────────┘   └──────┬──────┘
//!                                                               │
//!                      ┌───────────┐   ┌──────────┐   ┌────────▼──────┐
//!       HTTP / CLI ───▶│  Cache     │──▶│ Encoder  │──▶│ Search +      │
//!                      │ redis/mem │   │          │   │ Rerank        │
//!                      └───────────┘   └──────────┘   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors per stage |
//! | [`credentials`] | AWS credential fallback chain and SigV4 signing |
//! | [`fetch`] | Object store access (S3, local directory) |
//! | [`archive`] | Safe ZIP unpacking and checksum verification |
//! | [`manifest`] | Artifact manifest validation |
//! | [`generation`] | One loaded, immutable index generation |
//! | [`store`] | Hot-swappable active generation |
//! | [`lifecycle`] | Acquisition state machine |
//! | [`embedding`] | Query encoders |
//! | [`rerank`] | Cross-encoder reranking |
//! | [`cache`] | TTL result cache |
//! | [`workers`] | Bounded pool for CPU-heavy query work |
//! | [`pipeline`] | Query pipeline |
//! | [`resources`] | Host CPU and memory usage for health |
//! | [`service`] | Assembled service |
//! | [`server`] | HTTP server |

pub mod archive;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod lifecycle;
pub mod manifest;
pub mod pipeline;
pub mod rerank;
pub mod resources;
pub mod server;
pub mod service;
pub mod store;
pub mod workers;
