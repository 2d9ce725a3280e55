//! webharvest - multi-tenant web crawling and scraping server.
//!
//! Operators define websites, URL lists, queries, and per-module
//! configurations over a JSON/HTTP control plane; the server supervises
//! long-lived worker tasks (crawlers, parsers, extractors, analyzers)
//! whose state lives in SQLite so work survives restarts.

pub mod cli;
pub mod config;
pub mod markov;
pub mod models;
pub mod modules;
pub mod net;
pub mod queries;
pub mod repository;
pub mod server;
pub mod supervisor;
pub mod utils;
