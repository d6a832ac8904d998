pub mod attic;
pub mod checked_file;
pub mod file_ids;
pub mod index_storage;
pub mod layout;
pub mod persistent_map;
pub mod stamp;
pub mod value_container;

pub use attic::ContentAttic;
pub use file_ids::FileIdRegistry;
pub use index_storage::{IndexStorage, MapIndexStorage, StorageStats};
pub use layout::IndexLayout;
pub use persistent_map::PersistentMap;
pub use stamp::IndexingStamps;
pub use value_container::{InputIdIter, ValueContainer};
