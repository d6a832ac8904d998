pub mod event;
pub mod extension;
pub mod file;
pub mod project;

pub use event::*;
pub use extension::*;
pub use file::*;
pub use project::*;
