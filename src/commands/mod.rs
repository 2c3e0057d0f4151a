//! CLI command implementations
//!
//! Every command takes an open [`Session`](crate::programmers::Session),
//! does its work and leaves programming mode before returning, so the
//! target restarts into the application.
//!
//! Input files ending in `.hex` or `.ihx` are Intel HEX images. Anything
//! else is taken as a raw binary starting at address 0.

mod erase;
mod info;
mod list;
mod progress;
mod read;
mod verify;
mod write;

pub use erase::run_erase;
pub use info::run_info;
pub use list::{list_parts, list_programmers};
pub use read::run_read;
pub use verify::run_verify;
pub use write::{run_set, run_write};

use std::fs;
use std::path::Path;
use stkflash_core::hex::HexImage;

/// Size in the largest unit that divides it exactly
fn format_size(bytes: u32) -> String {
    const KIB: u32 = 1024;
    const MIB: u32 = 1024 * KIB;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= KIB && bytes % KIB == 0 {
        format!("{} KiB", bytes / KIB)
    } else {
        format!("{} B", bytes)
    }
}

/// Whether `path` names an Intel HEX file
fn is_hex_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("hex") || e.eq_ignore_ascii_case("ihx"))
}

/// Load a firmware image from an Intel HEX or raw binary file
fn load_image_file(path: &Path) -> Result<HexImage, Box<dyn std::error::Error>> {
    let image = if is_hex_path(path) {
        let text = fs::read_to_string(path)?;
        HexImage::parse(&text).map_err(|e| format!("{}: {}", path.display(), e))?
    } else {
        HexImage::from_binary(0, &fs::read(path)?)
            .map_err(|e| format!("{}: {}", path.display(), e))?
    };
    println!("Read {} bytes from {:?}", image.byte_count(), path);
    Ok(image)
}
