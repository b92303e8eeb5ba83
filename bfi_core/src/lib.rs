pub mod cells;
pub mod label;
pub mod package;

pub use cells::{CellName, CellResolver};
pub use label::{BuildInclude, IncludeLabel, LoadLabel};
pub use package::PackageLabel;
