//! Concrete package managers.
//!
//! - [`python::PipManager`]: wheels in `site-packages`, fixed by in-place swap
//! - [`os::OsManager`]: apk, dpkg and rpm databases, fixed through the native
//!   transaction or, for dpkg without its binary, by editing the database

pub mod os;
pub mod python;

pub use os::OsManager;
pub use python::PipManager;
