mod rendered;
mod report;
mod site;
mod templates;

pub use rendered::*;
pub use report::*;
pub use site::*;
pub use templates::*;
