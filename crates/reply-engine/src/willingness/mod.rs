// src/willingness/mod.rs

//! Decaying per-conversation willingness model

pub mod willingness_config;
pub mod willingness_store;

pub use willingness_config::WillingnessConfig;
pub use willingness_store::{probability_for_score, WillingnessState, WillingnessStore};

/// Create a willingness store with default tuning
pub fn create_default_willingness_store() -> crate::error::EngineResult<WillingnessStore> {
    WillingnessStore::new(WillingnessConfig::default())
}
