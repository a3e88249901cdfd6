//! Generation backends that plug into the orchestrator

pub mod http_backend;

pub use http_backend::HttpGenerationBackend;
