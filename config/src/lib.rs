pub mod loader;
pub mod paths;
pub mod validate;

pub use loader::*;
pub use paths::*;
pub use validate::*;
