//! Verify command implementation

use super::load_image_file;
use super::progress::IndicatifProgress;
use crate::programmers::Session;
use std::path::Path;
use stkflash_core::memory::MemoryKind;

/// Compare a memory against a firmware file
///
/// A mismatch fails with the first differing address.
pub fn run_verify(
    session: &mut Session,
    kind: MemoryKind,
    input: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = load_image_file(input)?;

    session.set_progress(Box::new(IndicatifProgress::new()));
    let compared = session.verify_image(kind, &image)?;
    session.close()?;

    println!("Verification passed: {} bytes of {} match", compared, kind);
    Ok(())
}
