pub mod comparable;
pub mod extension;
pub mod flux;
pub mod flux_config;
pub mod validation;
