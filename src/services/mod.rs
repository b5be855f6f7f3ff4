pub mod synthesis;

pub use synthesis::{merge_fragment_names, synthesize};
