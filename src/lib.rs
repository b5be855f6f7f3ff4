pub mod assemble;
pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod render;
pub mod services;
pub mod utils;
pub mod validate;

pub use catalog::{load_catalog, Catalog, CatalogHandle};
pub use error::{SynthError, SynthResult};
pub use models::{RenderedConfiguration, SiteParameters, ValidationReport};
pub use services::synthesize;
