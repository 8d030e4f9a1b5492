pub mod entry;
pub mod header;
pub mod package;
pub mod qfs;
pub mod validate;
pub mod writer;

pub use entry::{Entry, Hole, Tgir};
pub use header::Header;
pub use package::{Mode, Package, ReadError};
pub use validate::{validate_package, ValidateError};
pub use writer::write_package;
