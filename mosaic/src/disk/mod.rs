//! Disk image operations used by the image-backed drivers.
//!
//! - `Disk` - RAII guard for image files under construction
//! - `qcow2` - native qcow2 formatting and copy-on-write children
//! - `mkfs` - filesystem creation and offline resize
//! - `loop_device` / `nbd` - exposing images as block devices

pub mod constants;
mod image;
pub mod loop_device;
pub mod mkfs;
pub mod nbd;
pub mod qcow2;

pub use image::{Disk, DiskFormat};
