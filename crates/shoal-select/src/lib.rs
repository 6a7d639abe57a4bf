//! Test selection: kinds, tag expressions, tag files, and the filtering
//! pipeline that turns a selector description into an ordered list of tests.

pub mod config;
pub mod explorer;
pub mod expr;
pub mod kinds;
pub mod selector;
pub mod tags_config;

pub use config::SelectorConfig;
pub use explorer::{FsExplorer, TestFileExplorer};
pub use expr::TagExpr;
pub use kinds::{SelectionFamily, TestKind};
pub use selector::{select_tests, SelectOptions, Selection};
pub use tags_config::TagsConfig;
