#![doc = "sourcetext-core: core logic library for sourcetext."]

//! Splits submitted documents (HTML or Markdown) into translatable source text
//! units, keeps each unit's id stable across edits by fingerprinting
//! `(text, occurrence)`, and writes the document back with every block
//! wrapped in a marker carrying that id.
//!
//! # Usage
//! Build a [`synchronise::SynchroniseRequest`], pick stores from [`store`]
//! (or implement the traits in [`contract`]) and call
//! [`synchronise::synchronise`].

pub mod annotate;
pub mod config;
pub mod contract;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod locks;
pub mod markup;
pub mod reconcile;
pub mod store;
pub mod synchronise;

pub use config::PipelineConfig;
pub use error::{PipelineError, StoreError, SynchroniseError};
pub use markup::ContentFormat;
pub use synchronise::{synchronise, SynchroniseReport, SynchroniseRequest};
