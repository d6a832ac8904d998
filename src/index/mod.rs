pub mod builtin;
pub mod file_based;
pub mod map_reduce;
pub mod membership;
pub mod registry;
pub mod scanner;

pub use builtin::{FileNameIndex, IdentifierIndex, FILE_NAMES, IDENTIFIERS};
pub use file_based::{FileBasedIndex, FileBasedIndexBuilder};
pub use map_reduce::{Indexer, MapReduceIndex, UpdatableIndex};
pub use membership::{ContentRootMembership, PathContentRoots};
pub use registry::{IndexState, ValueHit};
pub use scanner::{ScanHandle, ScanOutcome};
