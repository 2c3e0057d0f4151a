//! Read command implementation

use super::is_hex_path;
use super::progress::IndicatifProgress;
use crate::programmers::Session;
use std::fs;
use std::path::Path;
use stkflash_core::hex;
use stkflash_core::memory::MemoryKind;

/// Read a whole memory and save it to `output`
pub fn run_read(
    session: &mut Session,
    kind: MemoryKind,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    session.set_progress(Box::new(IndicatifProgress::new()));
    let data = session.read_region(kind)?.to_vec();
    session.close()?;

    if is_hex_path(output) {
        fs::write(output, hex::encode(&data, true))?;
        println!("Wrote {} as Intel HEX to {:?}", kind, output);
    } else {
        fs::write(output, &data)?;
        println!("Wrote {} bytes of {} to {:?}", data.len(), kind, output);
    }
    Ok(())
}
