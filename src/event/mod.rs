pub mod stream;
pub mod watcher;

pub use stream::EventPipeline;
pub use watcher::EventWatcher;
