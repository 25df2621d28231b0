//! Eclusa kernel : ingestion TCP des WORDs PLC, détection de fronts par bit et
//! suivi des occurrences de falhas/eventos d'une eclusa.
//!
//! Chaîne : `server` -> `pipeline` (`decoder` -> `detector`) -> `tracker` -> `store`.
//! `http` et `stats` lisent le store et la carte des définitions.

pub mod config;
pub mod decoder;
pub mod detector;
pub mod health;
pub mod http;
pub mod kernel;
pub mod mapping;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod stats;
pub mod store;
pub mod tracker;

pub use kernel::Kernel;
