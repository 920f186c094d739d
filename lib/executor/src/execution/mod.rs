pub mod error;
pub mod load;
pub mod loader;
pub mod plan;
pub mod result;
pub mod trace;
