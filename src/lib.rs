//! Document extraction pipeline
//!
//! This library provides the core functionality for docpipe, which turns
//! uploaded documents (PDFs, zip archives of PDFs) into structured records
//! using Cloudflare Workers AI, post-processes them through configurable
//! agent pipelines, and matches accepted records against a supplier catalog.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
