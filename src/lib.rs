pub mod loader;
pub mod raptor;
