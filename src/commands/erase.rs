//! Erase command implementation

use crate::programmers::Session;

/// Erase flash and EEPROM
pub fn run_erase(session: &mut Session) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = session.chip_erase() {
        let bootloader = session.bootloader();
        if bootloader.has_erase_pointer_defect() {
            return Err(format!(
                "{}\nThe {} bootloader cannot erase the whole chip; write erases pages as it goes",
                e, bootloader
            )
            .into());
        }
        return Err(e.into());
    }
    session.close()?;
    println!("Chip erase complete");
    Ok(())
}
