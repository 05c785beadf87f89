//! Directory listings and recursive size aggregation.

pub mod du;
pub mod snapshot;

pub use du::aggregate;
pub use snapshot::{DirectorySnapshot, DirectorySnapshotter, Entry, EntryKind};
