pub mod rows;
pub mod scan;

pub use rows::RowSet;
pub use scan::{ColumnMapper, ScanApi};
