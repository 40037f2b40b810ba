pub mod filesystem;
pub mod finder;
pub mod grid;
pub mod history;

pub use filesystem::FilesystemAssetSource;
pub use finder::{DuplicateFinder, PageRequest};
pub use grid::LumaGridExtractor;
pub use history::{DeletionRecord, HistoryError, HistoryLog};
