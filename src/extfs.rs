//! An ext2/ext3-style filesystem living inside partitions of a disk image.

pub mod bitmap;
pub mod codec;
pub mod device;
pub mod disk;
pub mod format;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod kernel;
pub mod mount;
pub mod partition;
pub mod perms;
pub mod report;
pub mod structs;
pub mod users;

// vim:ts=2 sw=2
