//! traitforge: weighted trait resolution for parametric scenes, and the job
//! system that generates and renders variants asynchronously.

pub mod api;
pub mod batch;
pub mod broker;
pub mod config;
pub mod error;
pub mod exporter;
pub mod hooks;
pub mod jobs;
pub mod metadata_store;
pub mod model;
pub mod resolver;
pub mod results;
pub mod scene;
pub mod worker;
