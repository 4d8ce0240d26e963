//! Terminal output for the `sharedlock` CLI

pub mod output;
pub mod table;
pub mod theme;

pub use output::*;
pub use table::records_table;
