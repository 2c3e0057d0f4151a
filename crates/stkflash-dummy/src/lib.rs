//! stkflash-dummy - Simulated STK500v2 bootloader for testing
//!
//! This crate emulates an ATmega2560 running an STK500v2 bootloader, with
//! flash, EEPROM, fuses and lock bits held in memory. It's useful for
//! testing and development without real hardware.
//!
//! The simulator can misbehave on request: ignore sign-ons, refuse
//! programming mode, drop, corrupt or precede answers with stale frames,
//! flip a bit while programming a page, and reproduce the erase-pointer
//! defect of the Arduino Mega 2560 bootloader.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use stkflash_core::memory::MemoryKind;
use stkflash_stk500v2::frame::{encode_frame, Feed, FrameParser};
use stkflash_stk500v2::protocol::*;
use stkflash_stk500v2::{ResetLine, Result, Status, Transport};

/// Configuration for the simulated target
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Answer to SIGN_ON
    pub sign_on: String,
    /// Device signature bytes
    pub signature: [u8; 3],
    /// Flash size in bytes
    pub flash_size: usize,
    /// Flash page size in bytes
    pub flash_page_size: usize,
    /// EEPROM size in bytes
    pub eeprom_size: usize,
    /// Erase flash through a pointer that ignores the written address
    pub erase_pointer_defect: bool,
    /// Hardware version parameter
    pub hw_version: u8,
    /// Firmware version parameters (major, minor)
    pub sw_version: (u8, u8),
}

impl Default for SimConfig {
    /// Arduino Mega 2560 with its stock bootloader
    fn default() -> Self {
        Self {
            sign_on: SIGNATURE_AVRISP_2.to_string(),
            signature: [0x1E, 0x98, 0x01],
            flash_size: 256 * 1024,
            flash_page_size: 256,
            eeprom_size: 4096,
            erase_pointer_defect: true,
            hw_version: 0x0F,
            sw_version: (2, 10),
        }
    }
}

impl SimConfig {
    /// ATmega2560 behind a well-behaved STK500v2 programmer
    pub fn stk500v2() -> Self {
        Self {
            sign_on: SIGNATURE_STK500_2.to_string(),
            erase_pointer_defect: false,
            hw_version: 2,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    sign_on_failures: u32,
    program_mode_failures: u32,
    drop_responses: u32,
    corrupt_responses: u32,
    stale_frames: u32,
    flip_bit_at: Option<usize>,
}

struct Device {
    config: SimConfig,
    flash: Vec<u8>,
    eeprom: Vec<u8>,
    lfuse: u8,
    hfuse: u8,
    efuse: u8,
    lock: u8,
    calibration: u8,
    params: BTreeMap<u8, u8>,
    /// Word address for flash, byte address for EEPROM
    address: u32,
    erase_pointer: usize,
    program_mode: bool,
}

impl Device {
    fn new(config: SimConfig) -> Self {
        let mut params = BTreeMap::new();
        params.insert(PARAM_HW_VER, config.hw_version);
        params.insert(PARAM_SW_MAJOR, config.sw_version.0);
        params.insert(PARAM_SW_MINOR, config.sw_version.1);
        Self {
            flash: vec![0xFF; config.flash_size],
            eeprom: vec![0xFF; config.eeprom_size],
            lfuse: 0xFF,
            hfuse: 0xD8,
            efuse: 0xFD,
            lock: 0xFF,
            calibration: 0x9A,
            params,
            address: 0,
            erase_pointer: 0,
            program_mode: false,
            config,
        }
    }

    fn reset(&mut self) {
        self.address = 0;
        self.erase_pointer = 0;
        self.program_mode = false;
    }
}

struct Inner {
    device: Device,
    faults: Faults,
    parser: FrameParser,
    output: VecDeque<u8>,
    counts: BTreeMap<u8, usize>,
    page_writes: Vec<u32>,
    resets: usize,
}

fn ok(command: u8) -> Vec<u8> {
    vec![command, Status::Ok.to_u8()]
}

fn failed(command: u8) -> Vec<u8> {
    vec![command, Status::Failed.to_u8()]
}

fn byte_answer(command: u8, value: u8) -> Vec<u8> {
    vec![command, Status::Ok.to_u8(), value, Status::Ok.to_u8()]
}

impl Inner {
    fn receive(&mut self, byte: u8) {
        match self.parser.feed(byte) {
            Feed::Pending => {}
            Feed::Frame { sequence, body } => {
                if let Some(answer) = self.handle(&body) {
                    self.respond(sequence, &answer);
                }
            }
            Feed::ChecksumMismatch => log::debug!("sim: dropping frame with bad checksum"),
            Feed::TooLarge { len } => log::debug!("sim: dropping {} byte frame", len),
        }
    }

    fn respond(&mut self, sequence: u8, answer: &[u8]) {
        let faults = &mut self.faults;
        if faults.drop_responses > 0 {
            faults.drop_responses -= 1;
            log::trace!("sim: dropping answer to 0x{:02X}", answer[0]);
            return;
        }
        if faults.stale_frames > 0 {
            faults.stale_frames -= 1;
            self.output
                .extend(encode_frame(sequence.wrapping_sub(1), answer));
        }
        let mut frame = encode_frame(sequence, answer);
        if faults.corrupt_responses > 0 {
            faults.corrupt_responses -= 1;
            if let Some(last) = frame.last_mut() {
                *last ^= 0xFF;
            }
        }
        self.output.extend(frame);
    }

    fn handle(&mut self, body: &[u8]) -> Option<Vec<u8>> {
        let command = *body.first()?;
        *self.counts.entry(command).or_default() += 1;
        let dev = &mut self.device;

        let answer = match command {
            CMD_SIGN_ON => {
                if self.faults.sign_on_failures > 0 {
                    self.faults.sign_on_failures -= 1;
                    return None;
                }
                let name = dev.config.sign_on.as_bytes();
                let mut answer = vec![CMD_SIGN_ON, Status::Ok.to_u8(), name.len() as u8];
                answer.extend_from_slice(name);
                answer
            }
            CMD_GET_PARAMETER => {
                let value = body.get(1).and_then(|p| dev.params.get(p)).copied();
                match value {
                    Some(value) => vec![command, Status::Ok.to_u8(), value],
                    None => failed(command),
                }
            }
            CMD_SET_PARAMETER => match (body.get(1), body.get(2)) {
                (Some(&param), Some(&value)) => {
                    dev.params.insert(param, value);
                    ok(command)
                }
                _ => failed(command),
            },
            CMD_ENTER_PROGMODE_ISP => {
                if self.faults.program_mode_failures > 0 {
                    self.faults.program_mode_failures -= 1;
                    failed(command)
                } else if body.get(8..10) == Some(&[0xAC, 0x53][..]) {
                    dev.program_mode = true;
                    ok(command)
                } else {
                    failed(command)
                }
            }
            CMD_LEAVE_PROGMODE_ISP => {
                dev.program_mode = false;
                ok(command)
            }
            CMD_CHIP_ERASE_ISP => {
                if dev.config.erase_pointer_defect {
                    // Only rewinds the pointer, and reports failure doing so
                    dev.erase_pointer = 0;
                    failed(command)
                } else {
                    dev.flash.fill(0xFF);
                    dev.eeprom.fill(0xFF);
                    ok(command)
                }
            }
            CMD_LOAD_ADDRESS => match body.get(1..5) {
                Some(bytes) => {
                    let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    dev.address = value & !LOAD_EXTENDED_ADDRESS;
                    ok(command)
                }
                None => failed(command),
            },
            CMD_PROGRAM_FLASH_ISP | CMD_PROGRAM_EEPROM_ISP => {
                return Some(self.program(body));
            }
            CMD_READ_FLASH_ISP | CMD_READ_EEPROM_ISP => {
                if body.len() < 4 {
                    return Some(failed(command));
                }
                let len = u16::from_be_bytes([body[1], body[2]]) as usize;
                let flash = command == CMD_READ_FLASH_ISP;
                let (memory, addr) = if flash {
                    (&dev.flash, dev.address as usize * 2)
                } else {
                    (&dev.eeprom, dev.address as usize)
                };
                let Some(data) = memory.get(addr..addr + len) else {
                    return Some(failed(command));
                };
                let mut answer = ok(command);
                answer.extend_from_slice(data);
                answer.push(Status::Ok.to_u8());
                dev.address += if flash { len as u32 / 2 } else { len as u32 };
                answer
            }
            CMD_READ_FUSE_ISP | CMD_READ_LOCK_ISP | CMD_READ_SIGNATURE_ISP
            | CMD_READ_OSCCAL_ISP => {
                let Some(instr) = body.get(2..6) else {
                    return Some(failed(command));
                };
                let value = match (command, instr[0], instr[1]) {
                    (CMD_READ_FUSE_ISP, 0x50, 0x00) => dev.lfuse,
                    (CMD_READ_FUSE_ISP, 0x58, 0x08) => dev.hfuse,
                    (CMD_READ_FUSE_ISP, 0x50, 0x08) => dev.efuse,
                    (CMD_READ_LOCK_ISP, 0x58, 0x00) => dev.lock,
                    (CMD_READ_SIGNATURE_ISP, 0x30, _) => dev
                        .config
                        .signature
                        .get(instr[2] as usize)
                        .copied()
                        .unwrap_or(0xFF),
                    (CMD_READ_OSCCAL_ISP, 0x38, _) => dev.calibration,
                    _ => return Some(failed(command)),
                };
                byte_answer(command, value)
            }
            CMD_PROGRAM_FUSE_ISP | CMD_PROGRAM_LOCK_ISP => {
                let Some(instr) = body.get(1..5) else {
                    return Some(failed(command));
                };
                let target = match (command, instr[0], instr[1]) {
                    (CMD_PROGRAM_FUSE_ISP, 0xAC, 0xA0) => &mut dev.lfuse,
                    (CMD_PROGRAM_FUSE_ISP, 0xAC, 0xA8) => &mut dev.hfuse,
                    (CMD_PROGRAM_FUSE_ISP, 0xAC, 0xA4) => &mut dev.efuse,
                    (CMD_PROGRAM_LOCK_ISP, 0xAC, b) if b & 0xE0 == 0xE0 => &mut dev.lock,
                    _ => return Some(failed(command)),
                };
                *target = instr[3];
                vec![command, Status::Ok.to_u8(), Status::Ok.to_u8()]
            }
            _ => vec![command, Status::UnknownCommand.to_u8()],
        };
        Some(answer)
    }

    fn program(&mut self, body: &[u8]) -> Vec<u8> {
        let command = body[0];
        if body.len() < 10 {
            return failed(command);
        }
        let len = u16::from_be_bytes([body[1], body[2]]) as usize;
        let data = &body[10..];
        if data.len() != len {
            return failed(command);
        }

        let dev = &mut self.device;
        if command == CMD_PROGRAM_EEPROM_ISP {
            let addr = dev.address as usize;
            let Some(target) = dev.eeprom.get_mut(addr..addr + len) else {
                return failed(command);
            };
            target.copy_from_slice(data);
            dev.address += len as u32;
            return ok(command);
        }

        let addr = dev.address as usize * 2;
        if addr + len > dev.flash.len() {
            return failed(command);
        }
        let erase = if dev.config.erase_pointer_defect {
            let start = dev.erase_pointer;
            dev.erase_pointer += dev.config.flash_page_size;
            start..(start + dev.config.flash_page_size).min(dev.flash.len())
        } else {
            addr..addr + len
        };
        if erase.start < dev.flash.len() {
            dev.flash[erase].fill(0xFF);
        }
        // Programming only clears bits
        for (cell, &byte) in dev.flash[addr..addr + len].iter_mut().zip(data) {
            *cell &= byte;
        }
        if self.faults.flip_bit_at == Some(addr) {
            self.faults.flip_bit_at = None;
            dev.flash[addr] ^= 0x01;
        }
        self.page_writes.push(addr as u32);
        dev.address += len as u32 / 2;
        ok(command)
    }
}

/// Handle on a simulated bootloader
///
/// Clones share the same device.
#[derive(Clone)]
pub struct SimulatedBootloader {
    inner: Rc<RefCell<Inner>>,
}

impl SimulatedBootloader {
    /// Create a simulated target with the given configuration
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                device: Device::new(config),
                faults: Faults::default(),
                parser: FrameParser::new(MAX_BODY_LEN),
                output: VecDeque::new(),
                counts: BTreeMap::new(),
                page_writes: Vec::new(),
                resets: 0,
            })),
        }
    }

    /// Arduino Mega 2560 with its stock bootloader
    pub fn arduino_mega() -> Self {
        Self::new(SimConfig::default())
    }

    /// Byte stream to the bootloader
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            inner: Rc::clone(&self.inner),
        }
    }

    /// The target's reset input
    pub fn reset_line(&self) -> SimResetLine {
        SimResetLine {
            inner: Rc::clone(&self.inner),
            high: true,
        }
    }

    /// Copy of the flash content
    pub fn flash(&self) -> Vec<u8> {
        self.inner.borrow().device.flash.clone()
    }

    /// Overwrite flash starting at `addr`
    pub fn set_flash(&self, addr: usize, data: &[u8]) {
        self.inner.borrow_mut().device.flash[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Copy of the EEPROM content
    pub fn eeprom(&self) -> Vec<u8> {
        self.inner.borrow().device.eeprom.clone()
    }

    /// Overwrite EEPROM starting at `addr`
    pub fn set_eeprom(&self, addr: usize, data: &[u8]) {
        self.inner.borrow_mut().device.eeprom[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Current value of a configuration byte
    ///
    /// Only fuses, lock and calibration are single bytes; other kinds
    /// return `None`.
    pub fn config_byte(&self, kind: MemoryKind) -> Option<u8> {
        let inner = self.inner.borrow();
        let dev = &inner.device;
        match kind {
            MemoryKind::LFuse => Some(dev.lfuse),
            MemoryKind::HFuse => Some(dev.hfuse),
            MemoryKind::EFuse => Some(dev.efuse),
            MemoryKind::Lock => Some(dev.lock),
            MemoryKind::Calibration => Some(dev.calibration),
            _ => None,
        }
    }

    /// Whether the target is in programming mode
    pub fn in_program_mode(&self) -> bool {
        self.inner.borrow().device.program_mode
    }

    /// How many requests carrying `command` arrived
    pub fn command_count(&self, command: u8) -> usize {
        self.inner
            .borrow()
            .counts
            .get(&command)
            .copied()
            .unwrap_or(0)
    }

    /// Byte addresses of every flash page programmed, in order
    pub fn page_writes(&self) -> Vec<u32> {
        self.inner.borrow().page_writes.clone()
    }

    /// How many times the target was reset
    pub fn reset_count(&self) -> usize {
        self.inner.borrow().resets
    }

    /// Ignore the next `n` sign-on requests
    pub fn fail_sign_ons(&self, n: u32) {
        self.inner.borrow_mut().faults.sign_on_failures = n;
    }

    /// Refuse the next `n` requests to enter programming mode
    pub fn fail_program_mode(&self, n: u32) {
        self.inner.borrow_mut().faults.program_mode_failures = n;
    }

    /// Swallow the next `n` answers
    pub fn drop_responses(&self, n: u32) {
        self.inner.borrow_mut().faults.drop_responses = n;
    }

    /// Send the next `n` answers with a broken checksum
    pub fn corrupt_responses(&self, n: u32) {
        self.inner.borrow_mut().faults.corrupt_responses = n;
    }

    /// Precede the next `n` answers with a copy carrying the previous sequence number
    pub fn send_stale_frames(&self, n: u32) {
        self.inner.borrow_mut().faults.stale_frames = n;
    }

    /// Flip bit 0 of the first byte the next time the flash page at `addr` is programmed
    pub fn flip_bit_on_write(&self, addr: usize) {
        self.inner.borrow_mut().faults.flip_bit_at = Some(addr);
    }
}

/// Host side of the simulated serial link
pub struct SimTransport {
    inner: Rc<RefCell<Inner>>,
}

impl Transport for SimTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        for &byte in data {
            inner.receive(byte);
        }
        Ok(())
    }

    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>> {
        Ok(self.inner.borrow_mut().output.pop_front())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.inner.borrow_mut().output.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn delay_us(&mut self, _us: u32) {}
}

/// Reset input of the simulated target
pub struct SimResetLine {
    inner: Rc<RefCell<Inner>>,
    high: bool,
}

impl ResetLine for SimResetLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        if self.high && !high {
            let mut inner = self.inner.borrow_mut();
            inner.device.reset();
            inner.parser.reset();
            inner.output.clear();
            inner.resets += 1;
        }
        self.high = high;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stkflash_core::hex;
    use stkflash_core::part::builtin;
    use stkflash_stk500v2::{
        Bootloader, EraseQuirk, ErrorClass, ProgrammingSession, SessionConfig, SessionFlags,
        SessionState, Stk500Error,
    };

    type Session = ProgrammingSession<SimTransport, SimResetLine>;

    fn session(sim: &SimulatedBootloader, erase_quirk: EraseQuirk) -> Session {
        let config = SessionConfig {
            byte_timeout: Duration::from_millis(10),
            frame_timeout: Duration::from_millis(100),
            erase_quirk,
            ..SessionConfig::default()
        };
        ProgrammingSession::new(
            sim.transport(),
            sim.reset_line(),
            builtin::atmega2560().unwrap(),
            config,
        )
    }

    fn programmed(sim: &SimulatedBootloader, erase_quirk: EraseQuirk) -> Session {
        let mut s = session(sim, erase_quirk);
        s.sync().unwrap();
        s.enter_program_mode().unwrap();
        s
    }

    /// Intel HEX text placing `data` at `addr`
    fn hex_at(addr: usize, data: &[u8]) -> String {
        let mut image = vec![0xFF; addr + data.len()];
        image[addr..].copy_from_slice(data);
        hex::encode(&image, true)
    }

    #[test]
    fn test_sign_on_after_missed_attempts() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.fail_sign_ons(2);
        let mut s = session(&sim, EraseQuirk::Auto);

        s.sync().unwrap();
        assert_eq!(sim.command_count(CMD_SIGN_ON), 3);
        assert_eq!(sim.reset_count(), 1);
        assert_eq!(s.state(), SessionState::Syncing);
        assert_eq!(s.bootloader(), Bootloader::Arduino);
        assert!(s.flags().contains(SessionFlags::SIGNED_ON));
        assert!(s.flags().contains(SessionFlags::ERASE_QUIRK));
    }

    #[test]
    fn test_sign_on_gives_up() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.fail_sign_ons(100);
        let mut s = session(&sim, EraseQuirk::Auto);

        let err = s.sync().unwrap_err();
        assert!(matches!(err, Stk500Error::NotResponding));
        assert_eq!(sim.command_count(CMD_SIGN_ON), 6);
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.flags().is_empty());
    }

    #[test]
    fn test_unknown_bootloader_is_rejected() {
        let sim = SimulatedBootloader::new(SimConfig {
            sign_on: "AVRISP_MK2".to_string(),
            ..SimConfig::default()
        });
        let mut s = session(&sim, EraseQuirk::Auto);

        match s.sync().unwrap_err() {
            Stk500Error::UnsupportedBootloader(name) => assert_eq!(name, "AVRISP_MK2"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!s.flags().contains(SessionFlags::SIGNED_ON));
    }

    #[test]
    fn test_generic_programmer_has_no_erase_quirk() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let s = programmed(&sim, EraseQuirk::Auto);
        assert_eq!(s.bootloader(), Bootloader::Stk500v2);
        assert!(!s.flags().contains(SessionFlags::ERASE_QUIRK));
        assert_eq!(s.state(), SessionState::ProgramModeEntered);
    }

    #[test]
    fn test_only_changed_page_is_written() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        sim.set_flash(0, &[0x11; 256]);
        sim.set_flash(256, &[0x22; 256]);
        let mut s = programmed(&sim, EraseQuirk::Auto);

        let mut image = vec![0x11; 256];
        image.extend_from_slice(&[0x33; 256]);
        let stats = s.load_hex(MemoryKind::Flash, &hex::encode(&image, false)).unwrap();
        assert_eq!(stats.bytes, 512);
        assert_eq!(stats.changed, 256);

        assert_eq!(s.write_region(MemoryKind::Flash, true).unwrap(), 1);
        assert_eq!(sim.command_count(CMD_PROGRAM_FLASH_ISP), 1);
        assert_eq!(sim.page_writes(), vec![256]);
        assert_eq!(&sim.flash()[..512], &image[..]);
        assert!(!s.region(MemoryKind::Flash).unwrap().has_changes());
        assert_eq!(s.state(), SessionState::ProgramModeEntered);
    }

    #[test]
    fn test_verify_failure_leaves_page_dirty() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = programmed(&sim, EraseQuirk::Auto);
        s.load_hex(MemoryKind::Flash, &hex_at(0, &[0x5A; 512]))
            .unwrap();
        sim.flip_bit_on_write(256);

        match s.write_region(MemoryKind::Flash, true).unwrap_err() {
            Stk500Error::VerifyFailed {
                kind,
                addr,
                expected,
                found,
            } => {
                assert_eq!(kind, MemoryKind::Flash);
                assert_eq!(addr, 256);
                assert_eq!(expected, 0x5A);
                assert_eq!(found, 0x5B);
            }
            other => panic!("unexpected error: {other}"),
        }
        let flash = s.region(MemoryKind::Flash).unwrap();
        assert!(!flash.is_page_dirty(0).unwrap());
        assert!(flash.is_page_dirty(256).unwrap());

        // The fault was one-shot, a second pass repairs the page
        assert_eq!(s.write_region(MemoryKind::Flash, true).unwrap(), 1);
        assert!(!s.region(MemoryKind::Flash).unwrap().has_changes());
        assert_eq!(sim.flash()[256], 0x5A);
    }

    #[test]
    fn test_erase_pointer_workaround_rewrites_from_page_zero() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.set_flash(0, &[0x10; 256]);
        sim.set_flash(256, &[0x20; 256]);
        sim.set_flash(512, &[0x00; 256]);
        let mut s = programmed(&sim, EraseQuirk::Auto);

        s.load_hex(MemoryKind::Flash, &hex_at(512, &[0x55; 256]))
            .unwrap();
        assert_eq!(s.write_region(MemoryKind::Flash, true).unwrap(), 3);

        assert_eq!(sim.command_count(CMD_CHIP_ERASE_ISP), 1);
        assert_eq!(sim.page_writes(), vec![0, 256, 512]);
        let flash = sim.flash();
        assert!(flash[..256].iter().all(|&b| b == 0x10));
        assert!(flash[256..512].iter().all(|&b| b == 0x20));
        assert!(flash[512..768].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_erase_pointer_defect_without_workaround_corrupts() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.set_flash(0, &[0x10; 256]);
        sim.set_flash(512, &[0x00; 256]);
        let mut s = programmed(&sim, EraseQuirk::Never);

        s.load_hex(MemoryKind::Flash, &hex_at(512, &[0x55; 256]))
            .unwrap();
        let err = s.write_region(MemoryKind::Flash, true).unwrap_err();
        assert!(matches!(
            err,
            Stk500Error::VerifyFailed {
                addr: 512,
                expected: 0x55,
                found: 0x00,
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::Verification);
        // The pointer erased page zero instead
        assert!(sim.flash()[..256].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_program_mode_resyncs_on_failure() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.fail_program_mode(2);
        let mut s = session(&sim, EraseQuirk::Auto);

        s.enter_program_mode().unwrap();
        assert_eq!(sim.command_count(CMD_ENTER_PROGMODE_ISP), 3);
        assert_eq!(sim.command_count(CMD_SIGN_ON), 3);
        assert!(sim.in_program_mode());
        assert!(s.flags().contains(SessionFlags::PROGRAM_MODE));
        assert!(s.region(MemoryKind::Flash).unwrap().is_initialized());
    }

    #[test]
    fn test_program_mode_gives_up() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.fail_program_mode(100);
        let mut s = ProgrammingSession::new(
            sim.transport(),
            sim.reset_line(),
            builtin::atmega2560().unwrap(),
            SessionConfig {
                program_mode_attempts: 3,
                byte_timeout: Duration::from_millis(10),
                ..SessionConfig::default()
            },
        );
        assert!(matches!(
            s.enter_program_mode(),
            Err(Stk500Error::ProgramModeFailed(3))
        ));
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_corrupted_answer_is_retried() {
        let sim = SimulatedBootloader::arduino_mega();
        let mut s = programmed(&sim, EraseQuirk::Auto);

        sim.corrupt_responses(1);
        assert_eq!(s.read_signature().unwrap(), [0x1E, 0x98, 0x01]);
        assert_eq!(sim.command_count(CMD_READ_SIGNATURE_ISP), 4);
    }

    #[test]
    fn test_stale_frame_is_skipped() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = programmed(&sim, EraseQuirk::Auto);

        sim.send_stale_frames(1);
        let info = s.programmer_info().unwrap();
        assert_eq!(sim.command_count(CMD_GET_PARAMETER), 3);
        assert_eq!(info.bootloader, Bootloader::Stk500v2);
        assert_eq!(info.hw_version, 2);
        assert_eq!((info.sw_major, info.sw_minor), (2, 10));
    }

    #[test]
    fn test_retry_budget_aborts_session() {
        let sim = SimulatedBootloader::arduino_mega();
        let mut s = programmed(&sim, EraseQuirk::Auto);

        sim.drop_responses(u32::MAX);
        match s.read_page(MemoryKind::Flash, 0).unwrap_err() {
            Stk500Error::RetryBudgetExhausted { failures, .. } => assert_eq!(failures, 8),
            other => panic!("unexpected error: {other}"),
        }
        assert!(s.flags().contains(SessionFlags::ABORTED));
        assert!(matches!(
            s.read_page(MemoryKind::Flash, 0),
            Err(Stk500Error::Aborted)
        ));

        sim.drop_responses(0);
        s.sync().unwrap();
        s.enter_program_mode().unwrap();
        s.read_page(MemoryKind::Flash, 0).unwrap();
        assert!(s.region(MemoryKind::Flash).unwrap().is_loaded(0).unwrap());
    }

    #[test]
    fn test_fuse_write_skips_unchanged_value() {
        let sim = SimulatedBootloader::arduino_mega();
        let mut s = programmed(&sim, EraseQuirk::Auto);

        s.write_byte(MemoryKind::HFuse, 0, 0x99).unwrap();
        assert_eq!(sim.config_byte(MemoryKind::HFuse), Some(0x99));
        assert_eq!(sim.command_count(CMD_PROGRAM_FUSE_ISP), 1);

        s.write_byte(MemoryKind::HFuse, 0, 0x99).unwrap();
        assert_eq!(sim.command_count(CMD_PROGRAM_FUSE_ISP), 1);
        assert_eq!(s.read_byte(MemoryKind::HFuse, 0).unwrap(), 0x99);

        assert!(matches!(
            s.write_byte(MemoryKind::Signature, 0, 0),
            Err(Stk500Error::ReadOnly(MemoryKind::Signature))
        ));
    }

    #[test]
    fn test_fuse_region_write_and_verify() {
        let sim = SimulatedBootloader::arduino_mega();
        let mut s = programmed(&sim, EraseQuirk::Auto);

        s.region_mut(MemoryKind::LFuse).unwrap().set(0, 0xE2).unwrap();
        assert_eq!(s.write_region(MemoryKind::LFuse, true).unwrap(), 1);
        assert_eq!(sim.config_byte(MemoryKind::LFuse), Some(0xE2));
        s.verify(MemoryKind::LFuse).unwrap();
    }

    #[test]
    fn test_eeprom_write_preserves_rest_of_page() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.set_eeprom(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut s = programmed(&sim, EraseQuirk::Auto);

        s.region_mut(MemoryKind::Eeprom).unwrap().set(3, 0x42).unwrap();
        assert_eq!(s.write_region(MemoryKind::Eeprom, true).unwrap(), 1);
        assert_eq!(&sim.eeprom()[..8], &[1, 2, 3, 0x42, 5, 6, 7, 8]);
        // EEPROM never goes through the erase pointer
        assert_eq!(sim.command_count(CMD_CHIP_ERASE_ISP), 0);
    }

    #[test]
    fn test_read_region_reads_each_page_once() {
        let sim = SimulatedBootloader::arduino_mega();
        sim.set_eeprom(100, b"stkflash");
        let mut s = programmed(&sim, EraseQuirk::Auto);

        let data = s.read_region(MemoryKind::Eeprom).unwrap().to_vec();
        assert_eq!(&data[100..108], b"stkflash");
        assert_eq!(sim.command_count(CMD_READ_EEPROM_ISP), 4096 / 8);

        s.read_region(MemoryKind::Eeprom).unwrap();
        assert_eq!(sim.command_count(CMD_READ_EEPROM_ISP), 4096 / 8);
        assert_eq!(s.state(), SessionState::ProgramModeEntered);
    }

    #[test]
    fn test_verify_marks_mismatching_pages_dirty() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = programmed(&sim, EraseQuirk::Auto);
        s.load_hex(MemoryKind::Flash, &hex_at(0, &[0x42; 512]))
            .unwrap();
        s.write_region(MemoryKind::Flash, false).unwrap();
        s.verify(MemoryKind::Flash).unwrap();

        sim.set_flash(300, &[0x00]);
        assert!(matches!(
            s.verify(MemoryKind::Flash),
            Err(Stk500Error::VerifyFailed { addr: 300, .. })
        ));
        let flash = s.region(MemoryKind::Flash).unwrap();
        assert!(flash.is_page_dirty(256).unwrap());
        assert!(!flash.is_page_dirty(0).unwrap());
    }

    #[test]
    fn test_verify_image_against_device() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        sim.set_flash(0x100, &[0xAB; 32]);
        let mut s = programmed(&sim, EraseQuirk::Auto);

        let image = hex::HexImage::parse(&hex_at(0x100, &[0xAB; 32])).unwrap();
        assert_eq!(s.verify_image(MemoryKind::Flash, &image).unwrap(), 32);

        let other = hex::HexImage::parse(&hex_at(0x100, &[0xAC; 32])).unwrap();
        assert!(matches!(
            s.verify_image(MemoryKind::Flash, &other),
            Err(Stk500Error::VerifyFailed { addr: 0x100, .. })
        ));
    }

    #[test]
    fn test_high_flash_uses_extended_addressing() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = programmed(&sim, EraseQuirk::Auto);

        s.load_hex(MemoryKind::Flash, &hex_at(0x3_0000, &[0x77; 256]))
            .unwrap();
        assert_eq!(s.write_region(MemoryKind::Flash, true).unwrap(), 1);
        assert_eq!(sim.page_writes(), vec![0x3_0000]);
        assert!(sim.flash()[0x3_0000..0x3_0100].iter().all(|&b| b == 0x77));
    }

    #[test]
    fn test_out_of_range_image_changes_nothing() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = programmed(&sim, EraseQuirk::Auto);

        // One byte at 256 KiB, just past the end of flash
        let text = ":020000040004F6\n:0100000055AA\n:00000001FF\n";
        let err = s.load_hex(MemoryKind::Flash, text).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Data);
        assert!(!s.region(MemoryKind::Flash).unwrap().has_changes());
        assert_eq!(sim.command_count(CMD_READ_FLASH_ISP), 0);
    }

    #[test]
    fn test_page_out_of_range_sends_nothing() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = programmed(&sim, EraseQuirk::Auto);
        let load_address = sim.command_count(CMD_LOAD_ADDRESS);

        // 256 KiB of flash in 256-byte pages
        let err = s.write_page(MemoryKind::Flash, 1024).unwrap_err();
        assert!(matches!(
            err,
            Stk500Error::Core(stkflash_core::Error::AddressOutOfBounds {
                kind: MemoryKind::Flash,
                ..
            })
        ));
        assert_eq!(sim.command_count(CMD_LOAD_ADDRESS), load_address);
        assert_eq!(sim.command_count(CMD_PROGRAM_FLASH_ISP), 0);
        assert!(sim.page_writes().is_empty());

        assert!(s.read_page(MemoryKind::Flash, u32::MAX / 2).is_err());
        assert_eq!(sim.command_count(CMD_LOAD_ADDRESS), load_address);
        assert_eq!(sim.command_count(CMD_READ_FLASH_ISP), 0);
        assert_eq!(s.state(), SessionState::ProgramModeEntered);
    }

    #[test]
    fn test_page_out_of_range_before_sign_on() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        let mut s = session(&sim, EraseQuirk::Auto);

        assert_eq!(
            s.read_page(MemoryKind::Eeprom, 4096 / 8).unwrap_err().class(),
            ErrorClass::Data
        );
        assert_eq!(sim.command_count(CMD_SIGN_ON), 0);
        assert_eq!(sim.reset_count(), 0);
    }

    #[test]
    fn test_chip_erase_marks_buffer_dirty() {
        let sim = SimulatedBootloader::new(SimConfig::stk500v2());
        sim.set_flash(0, &[0x12; 256]);
        let mut s = programmed(&sim, EraseQuirk::Auto);
        s.read_page(MemoryKind::Flash, 0).unwrap();

        s.chip_erase().unwrap();
        assert!(sim.flash().iter().all(|&b| b == 0xFF));
        let flash = s.region(MemoryKind::Flash).unwrap();
        assert!(flash.is_page_dirty(0).unwrap());
        assert!(!flash.is_page_dirty(256).unwrap());
        assert!(!s.region(MemoryKind::Eeprom).unwrap().is_loaded(0).unwrap());

        // Writing the buffer back restores the old content
        assert_eq!(s.write_region(MemoryKind::Flash, true).unwrap(), 1);
        assert!(sim.flash()[..256].iter().all(|&b| b == 0x12));
    }

    #[test]
    fn test_signature_mismatch() {
        let sim = SimulatedBootloader::new(SimConfig {
            signature: [0x1E, 0x95, 0x0F],
            ..SimConfig::default()
        });
        let mut s = programmed(&sim, EraseQuirk::Auto);
        match s.read_signature().unwrap_err() {
            Stk500Error::SignatureMismatch { expected, found } => {
                assert_eq!(expected, [0x1E, 0x98, 0x01]);
                assert_eq!(found, [0x1E, 0x95, 0x0F]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_set_parameter_skips_equal_value() {
        let sim = SimulatedBootloader::arduino_mega();
        let mut s = programmed(&sim, EraseQuirk::Auto);

        s.set_parameter(PARAM_SW_MINOR, 11).unwrap();
        s.set_parameter(PARAM_SW_MINOR, 11).unwrap();
        assert_eq!(sim.command_count(CMD_SET_PARAMETER), 1);
        assert_eq!(s.get_parameter(PARAM_SW_MINOR).unwrap(), 11);
    }

    #[test]
    fn test_close_and_drop_leave_program_mode() {
        let sim = SimulatedBootloader::arduino_mega();
        let mut s = programmed(&sim, EraseQuirk::Auto);
        s.close().unwrap();
        assert!(!sim.in_program_mode());
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!s.region(MemoryKind::Flash).unwrap().is_initialized());

        {
            let _s = programmed(&sim, EraseQuirk::Auto);
            assert!(sim.in_program_mode());
        }
        assert!(!sim.in_program_mode());
        assert_eq!(sim.command_count(CMD_LEAVE_PROGMODE_ISP), 2);
    }
}
