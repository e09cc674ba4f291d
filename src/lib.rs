pub mod binaries;
pub mod extfs;
pub mod machine;
pub mod util;

// vim:ts=2 sw=2
