#[macro_use]
extern crate log;

pub mod fuse;
pub mod image;
