//! Programming session state machine
//!
//! A [`ProgrammingSession`] owns the framed link to the bootloader, the
//! target's reset line and one [`MemoryRegion`] per memory of the part.
//! Reads fill the regions, edits mark bytes and pages dirty, and writes
//! send only what is dirty.
//!
//! ```text
//! Disconnected -> Syncing -> ProgramModeEntered -> {Erasing|Reading|Writing|Verifying}
//!                                               -> ProgramModeLeft -> Disconnected
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;
use stkflash_core::hex::{HexImage, IngestStats};
use stkflash_core::isp::{InstructionTemplate, Operation};
use stkflash_core::memory::{MemoryKind, MemoryRegion};
use stkflash_core::part::PartDescription;

use crate::error::{ErrorClass, Result, Stk500Error};
use crate::frame::Framer;
use crate::protocol::*;
use crate::transport::{ResetLine, Transport};

/// How to handle the erase-pointer defect of some bootloaders
///
/// The Arduino Mega 2560 bootloader erases flash page by page through an
/// internal pointer that only advances on writes, ignoring the page address
/// of the write itself. Writes must then start at page zero and run
/// contiguously up to the last changed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraseQuirk {
    /// Apply when the sign-on identifies an affected bootloader
    #[default]
    Auto,
    /// Always apply
    Always,
    /// Never apply
    Never,
}

impl FromStr for EraseQuirk {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!(
                "invalid erase quirk mode '{}' (expected auto, always or never)",
                other
            )),
        }
    }
}

impl fmt::Display for EraseQuirk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Always => "always",
            Self::Never => "never",
        })
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest wait for any single byte of an answer
    pub byte_timeout: Duration,
    /// Longest wait for a complete answer
    pub frame_timeout: Duration,
    /// Sign-on exchanges per [`sync`](ProgrammingSession::sync)
    pub sign_on_attempts: u32,
    /// Full resynchronisations before giving up on programming mode
    pub program_mode_attempts: u32,
    /// Consecutive failed exchanges that abort the session
    pub max_consecutive_failures: u32,
    /// Pause before resetting the target
    pub regroup_delay: Duration,
    /// How long reset is held low (and high again before talking)
    pub reset_pulse: Duration,
    /// Time the bootloader needs after reset
    pub startup_delay: Duration,
    /// Erase-pointer workaround mode
    pub erase_quirk: EraseQuirk,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            byte_timeout: Duration::from_millis(500),
            frame_timeout: Duration::from_secs(2),
            sign_on_attempts: 6,
            program_mode_attempts: 10,
            max_consecutive_failures: 8,
            regroup_delay: Duration::from_millis(100),
            reset_pulse: Duration::from_millis(50),
            startup_delay: Duration::from_millis(25),
            erase_quirk: EraseQuirk::Auto,
        }
    }
}

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No contact with the bootloader
    Disconnected,
    /// Resetting the target and signing on; stays here once signed on
    Syncing,
    /// Programming mode entered, idle
    ProgramModeEntered,
    /// Chip erase in progress
    Erasing,
    /// Reading memory
    Reading,
    /// Writing memory
    Writing,
    /// Comparing memory with the buffers
    Verifying,
    /// Programming mode left, target running
    ProgramModeLeft,
}

bitflags! {
    /// Session mode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionFlags: u8 {
        /// Bootloader answered the sign-on
        const SIGNED_ON    = 1 << 0;
        /// Target is in serial programming mode
        const PROGRAM_MODE = 1 << 1;
        /// Flash writes use the erase-pointer workaround
        const ERASE_QUIRK  = 1 << 2;
        /// Too many consecutive failures; sync required
        const ABORTED      = 1 << 3;
    }
}

/// Bootloader flavour, as identified by its sign-on answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootloader {
    /// Not signed on yet
    Unknown,
    /// Arduino Mega 2560 bootloader ("AVRISP_2")
    Arduino,
    /// STK500v2 compatible programmer ("STK500_2")
    Stk500v2,
}

impl Bootloader {
    /// Identify a bootloader by its sign-on string
    pub fn from_signature(signature: &str) -> Option<Self> {
        match signature {
            SIGNATURE_AVRISP_2 => Some(Self::Arduino),
            SIGNATURE_STK500_2 => Some(Self::Stk500v2),
            _ => None,
        }
    }

    /// Whether flash writes suffer from the erase-pointer defect
    pub fn has_erase_pointer_defect(self) -> bool {
        self == Self::Arduino
    }
}

impl fmt::Display for Bootloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Arduino => "Arduino STK500v2 bootloader (AVRISP_2)",
            Self::Stk500v2 => "STK500v2 (STK500_2)",
        })
    }
}

/// Versions reported by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammerInfo {
    /// Detected flavour
    pub bootloader: Bootloader,
    /// Hardware version
    pub hw_version: u8,
    /// Firmware major version
    pub sw_major: u8,
    /// Firmware minor version
    pub sw_minor: u8,
}

/// Callback for progress reporting during long operations
pub trait SessionProgress {
    /// Called when starting to read a memory
    fn reading(&mut self, kind: MemoryKind, total_bytes: usize);

    /// Called to update read progress
    fn read_progress(&mut self, bytes_read: usize);

    /// Called when starting to write a memory
    fn writing(&mut self, kind: MemoryKind, bytes_to_write: usize);

    /// Called to update write progress
    fn write_progress(&mut self, bytes_written: usize);

    /// Called when starting to verify a memory
    fn verifying(&mut self, kind: MemoryKind, total_bytes: usize);

    /// Called to update verify progress
    fn verify_progress(&mut self, bytes_verified: usize);

    /// Called when the operation is complete
    fn complete(&mut self);
}

/// A no-op progress reporter
pub struct NoProgress;

impl SessionProgress for NoProgress {
    fn reading(&mut self, _kind: MemoryKind, _total_bytes: usize) {}
    fn read_progress(&mut self, _bytes_read: usize) {}
    fn writing(&mut self, _kind: MemoryKind, _bytes_to_write: usize) {}
    fn write_progress(&mut self, _bytes_written: usize) {}
    fn verifying(&mut self, _kind: MemoryKind, _total_bytes: usize) {}
    fn verify_progress(&mut self, _bytes_verified: usize) {}
    fn complete(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusPolicy {
    /// Any status but OK is an error
    Strict,
    /// Hand back the answer whatever its status
    Accept,
}

/// Everything needed to move pages of one paged memory
#[derive(Debug, Clone, Copy)]
struct PagedAccess {
    kind: MemoryKind,
    page_size: u32,
    read_cmd: u8,
    program_cmd: u8,
    /// First byte of the read instruction
    read_op: u8,
    /// Mode byte with the write-page bit set
    mode: u8,
    delay: u8,
    /// Load-page (paged) or write (unpaged) instruction byte
    load_op: u8,
    /// Write-page instruction byte, 0 when unpaged
    write_op: u8,
    readback: [u8; 2],
    extended: bool,
    write_delay_us: u32,
}

/// Everything needed to move single bytes of an unpaged memory
#[derive(Debug, Clone, Copy)]
struct ByteAccess {
    kind: MemoryKind,
    read_cmd: u8,
    program_cmd: Option<u8>,
    read: Option<InstructionTemplate>,
    write: Option<InstructionTemplate>,
    write_delay_us: u32,
}

fn first_mismatch(expected: &[u8], found: &[u8]) -> Option<usize> {
    expected.iter().zip(found).position(|(a, b)| a != b)
}

/// Stateful controller for one target
pub struct ProgrammingSession<T: Transport, R: ResetLine> {
    framer: Framer<T>,
    reset: R,
    part: PartDescription,
    regions: Vec<MemoryRegion>,
    config: SessionConfig,
    state: SessionState,
    flags: SessionFlags,
    bootloader: Bootloader,
    failures: u32,
    /// Address the bootloader will use next without a LOAD_ADDRESS
    next_address: Option<(MemoryKind, u32)>,
    progress: Box<dyn SessionProgress>,
}

impl<T: Transport, R: ResetLine> ProgrammingSession<T, R> {
    /// Create a session; nothing is sent until [`sync`](Self::sync)
    pub fn new(transport: T, reset: R, part: PartDescription, config: SessionConfig) -> Self {
        let framer = Framer::new(transport, config.byte_timeout, config.frame_timeout);
        let regions = part.memory_regions();
        Self {
            framer,
            reset,
            part,
            regions,
            config,
            state: SessionState::Disconnected,
            flags: SessionFlags::empty(),
            bootloader: Bootloader::Unknown,
            failures: 0,
            next_address: None,
            progress: Box::new(NoProgress),
        }
    }

    /// Report progress of long operations to `progress`
    pub fn set_progress(&mut self, progress: Box<dyn SessionProgress>) {
        self.progress = progress;
    }

    /// The part being programmed
    pub fn part(&self) -> &PartDescription {
        &self.part
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current mode flags
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Bootloader detected by the last sign-on
    pub fn bootloader(&self) -> Bootloader {
        self.bootloader
    }

    /// Session tuning
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Access the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        self.framer.transport_mut()
    }

    /// Memory region of kind `kind`
    pub fn region(&self, kind: MemoryKind) -> Result<&MemoryRegion> {
        self.regions
            .iter()
            .find(|r| r.kind() == kind)
            .ok_or(Stk500Error::Core(stkflash_core::Error::NoSuchRegion(kind)))
    }

    /// Mutable memory region of kind `kind`
    pub fn region_mut(&mut self, kind: MemoryKind) -> Result<&mut MemoryRegion> {
        self.regions
            .iter_mut()
            .find(|r| r.kind() == kind)
            .ok_or(Stk500Error::Core(stkflash_core::Error::NoSuchRegion(kind)))
    }

    // ------------------------------------------------------------------
    // Low-level exchanges
    // ------------------------------------------------------------------

    fn delay(&mut self, duration: Duration) {
        let us = duration.as_micros().min(u32::MAX as u128) as u32;
        if us > 0 {
            self.framer.transport_mut().delay_us(us);
        }
    }

    /// One framed exchange, no retries
    fn command_with(
        &mut self,
        request: &[u8],
        max_len: usize,
        policy: StatusPolicy,
    ) -> Result<Vec<u8>> {
        let command = request[0];
        let answer = self.framer.exchange(request, max_len)?;
        if answer.len() < 2 || answer[0] != command {
            return Err(Stk500Error::UnexpectedResponse { command });
        }
        let status = Status::from_u8(answer[1]);
        if status != Status::Ok {
            log::debug!("{}: {}", command_name(command), status);
            if policy == StatusPolicy::Strict {
                return Err(Stk500Error::Status { command, status });
            }
        }
        Ok(answer)
    }

    fn command(&mut self, request: &[u8], max_len: usize) -> Result<Vec<u8>> {
        self.command_with(request, max_len, StatusPolicy::Strict)
    }

    /// Run `op` until it succeeds, counting consecutive failures
    ///
    /// Transport errors are retried. A bad status is retried once and then
    /// returned. Once the consecutive failure budget is spent the session
    /// is marked aborted.
    fn with_retry<V>(&mut self, mut op: impl FnMut(&mut Self) -> Result<V>) -> Result<V> {
        let mut status_failures = 0;
        loop {
            if self.flags.contains(SessionFlags::ABORTED) {
                return Err(Stk500Error::Aborted);
            }
            let err = match op(self) {
                Ok(value) => {
                    self.failures = 0;
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.next_address = None;
            let class = err.class();
            if !matches!(class, ErrorClass::Transport | ErrorClass::Protocol) {
                return Err(err);
            }

            self.failures += 1;
            log::warn!(
                "{} (failure {} of {})",
                err,
                self.failures,
                self.config.max_consecutive_failures
            );
            if self.failures >= self.config.max_consecutive_failures {
                self.flags = SessionFlags::ABORTED;
                self.state = SessionState::Disconnected;
                return Err(Stk500Error::RetryBudgetExhausted {
                    failures: self.failures,
                    last: err.to_string(),
                });
            }
            if class == ErrorClass::Protocol {
                status_failures += 1;
                if status_failures > 1 {
                    return Err(err);
                }
            }
            self.framer.transport_mut().discard_input()?;
        }
    }

    /// Put the session back to idle after an operation
    fn settle(&mut self) {
        self.state = if self.flags.contains(SessionFlags::PROGRAM_MODE) {
            SessionState::ProgramModeEntered
        } else if self.flags.contains(SessionFlags::SIGNED_ON) {
            SessionState::Syncing
        } else {
            SessionState::Disconnected
        };
    }

    fn ensure_signed_on(&mut self) -> Result<()> {
        if self.flags.contains(SessionFlags::ABORTED) {
            return Err(Stk500Error::Aborted);
        }
        if !self.flags.contains(SessionFlags::SIGNED_ON) {
            self.sync()?;
        }
        Ok(())
    }

    fn ensure_program_mode(&mut self) -> Result<()> {
        if self.flags.contains(SessionFlags::ABORTED) {
            return Err(Stk500Error::Aborted);
        }
        if !self.flags.contains(SessionFlags::PROGRAM_MODE) {
            self.enter_program_mode()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    fn pulse_reset(&mut self) -> Result<()> {
        let pulse = self.config.reset_pulse;
        self.reset.set_level(false)?;
        self.delay(pulse);
        self.reset.set_level(true)?;
        self.delay(pulse);
        self.framer.transport_mut().discard_input()
    }

    /// Reset the target and sign on to its bootloader
    ///
    /// Clears every flag, including a previous abort. Fails with
    /// [`Stk500Error::NotResponding`] once the sign-on attempts are spent.
    pub fn sync(&mut self) -> Result<()> {
        self.state = SessionState::Syncing;
        self.flags = SessionFlags::empty();
        self.failures = 0;
        self.next_address = None;
        self.bootloader = Bootloader::Unknown;

        let (regroup, startup) = (self.config.regroup_delay, self.config.startup_delay);
        self.delay(regroup);
        self.pulse_reset()?;
        self.delay(startup);
        self.framer.reset_sequence();

        for attempt in 1..=self.config.sign_on_attempts {
            match self.command(&[CMD_SIGN_ON], 64) {
                Ok(answer) => return self.signed_on(&answer),
                Err(e) if e.is_retryable() => {
                    log::debug!("Sign-on attempt {} failed: {}", attempt, e);
                    self.framer.transport_mut().discard_input()?;
                }
                Err(e) => {
                    self.state = SessionState::Disconnected;
                    return Err(e);
                }
            }
        }

        log::warn!(
            "No answer to {} sign-on attempts",
            self.config.sign_on_attempts
        );
        self.state = SessionState::Disconnected;
        Err(Stk500Error::NotResponding)
    }

    fn signed_on(&mut self, answer: &[u8]) -> Result<()> {
        let Some(&len) = answer.get(2) else {
            self.state = SessionState::Disconnected;
            return Err(Stk500Error::UnexpectedResponse {
                command: CMD_SIGN_ON,
            });
        };
        let end = (3 + len as usize).min(answer.len());
        let signature = String::from_utf8_lossy(&answer[3..end]).into_owned();

        let Some(bootloader) = Bootloader::from_signature(&signature) else {
            self.state = SessionState::Disconnected;
            return Err(Stk500Error::UnsupportedBootloader(signature));
        };

        self.bootloader = bootloader;
        self.flags.insert(SessionFlags::SIGNED_ON);
        let quirk = match self.config.erase_quirk {
            EraseQuirk::Auto => bootloader.has_erase_pointer_defect(),
            EraseQuirk::Always => true,
            EraseQuirk::Never => false,
        };
        self.flags.set(SessionFlags::ERASE_QUIRK, quirk);

        log::info!("Signed on to {}", bootloader);
        if quirk {
            log::debug!("Flash writes will use the erase-pointer workaround");
        }
        Ok(())
    }

    /// Put the target into serial programming mode
    ///
    /// A failed attempt resynchronises from scratch, since the target may
    /// have reset into an unknown state.
    pub fn enter_program_mode(&mut self) -> Result<()> {
        if self.flags.contains(SessionFlags::PROGRAM_MODE) {
            return Ok(());
        }

        let timing = self.part.timing;
        let mut request = vec![
            CMD_ENTER_PROGMODE_ISP,
            timing.timeout,
            timing.stab_delay,
            timing.cmd_exe_delay,
            timing.synch_loops,
            timing.byte_delay,
            timing.poll_value,
            timing.poll_index,
        ];
        request.extend_from_slice(&self.part.pgm_enable.build(0, 0));

        let attempts = self.config.program_mode_attempts;
        for attempt in 1..=attempts {
            if !self.flags.contains(SessionFlags::SIGNED_ON) {
                match self.sync() {
                    Ok(()) => {}
                    Err(e) if e.class() == ErrorClass::SyncLoss || e.is_retryable() => {
                        log::warn!("Programming mode attempt {}: {}", attempt, e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            match self.command(&request, 16) {
                Ok(_) => {
                    self.flags.insert(SessionFlags::PROGRAM_MODE);
                    self.state = SessionState::ProgramModeEntered;
                    self.failures = 0;
                    self.next_address = None;
                    for region in &mut self.regions {
                        region.init();
                    }
                    log::info!("Entered programming mode");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Programming mode attempt {}: {}", attempt, e);
                    self.flags.remove(SessionFlags::SIGNED_ON);
                }
            }
        }

        self.state = SessionState::Disconnected;
        Err(Stk500Error::ProgramModeFailed(attempts))
    }

    /// Leave programming mode, letting the target run
    ///
    /// Region buffers are kept.
    pub fn leave_program_mode(&mut self) -> Result<()> {
        if !self.flags.contains(SessionFlags::PROGRAM_MODE) {
            return Ok(());
        }
        let result = self.command(&[CMD_LEAVE_PROGMODE_ISP, 1, 1], 16);
        self.flags.remove(SessionFlags::PROGRAM_MODE);
        self.next_address = None;
        self.state = SessionState::ProgramModeLeft;
        log::debug!("Left programming mode");
        result.map(|_| ())
    }

    /// Leave programming mode and release the region buffers
    pub fn close(&mut self) -> Result<()> {
        let result = self.leave_program_mode();
        for region in &mut self.regions {
            region.dispose();
        }
        self.flags = SessionFlags::empty();
        self.state = SessionState::Disconnected;
        result
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Read a bootloader parameter
    pub fn get_parameter(&mut self, param: u8) -> Result<u8> {
        self.ensure_signed_on()?;
        self.with_retry(|s| {
            let answer = s.command(&[CMD_GET_PARAMETER, param], 16)?;
            answer
                .get(2)
                .copied()
                .ok_or(Stk500Error::UnexpectedResponse {
                    command: CMD_GET_PARAMETER,
                })
        })
    }

    /// Set a bootloader parameter, skipping the write if already equal
    pub fn set_parameter(&mut self, param: u8, value: u8) -> Result<()> {
        if self.get_parameter(param)? == value {
            log::debug!("Parameter 0x{:02X} already 0x{:02X}", param, value);
            return Ok(());
        }
        self.with_retry(|s| s.command(&[CMD_SET_PARAMETER, param, value], 16))?;
        Ok(())
    }

    /// Bootloader flavour and versions
    pub fn programmer_info(&mut self) -> Result<ProgrammerInfo> {
        Ok(ProgrammerInfo {
            hw_version: self.get_parameter(PARAM_HW_VER)?,
            sw_major: self.get_parameter(PARAM_SW_MAJOR)?,
            sw_minor: self.get_parameter(PARAM_SW_MINOR)?,
            bootloader: self.bootloader,
        })
    }

    // ------------------------------------------------------------------
    // Erase
    // ------------------------------------------------------------------

    fn erase_with(&mut self, policy: StatusPolicy) -> Result<()> {
        let delay_ms = (self.part.timing.chip_erase_delay_us / 1000).min(255) as u8;
        let mut request = vec![CMD_CHIP_ERASE_ISP, delay_ms, 0];
        request.extend_from_slice(&self.part.chip_erase.build(0, 0));

        self.state = SessionState::Erasing;
        let result = self.with_retry(|s| s.command_with(&request, 16, policy));
        self.next_address = None;
        if result.is_ok() {
            let wait = Duration::from_micros(self.part.timing.chip_erase_delay_us as u64);
            self.delay(wait);
        }
        self.settle();
        result.map(|_| ())
    }

    /// Erase flash and EEPROM
    pub fn chip_erase(&mut self) -> Result<()> {
        self.ensure_program_mode()?;
        self.erase_with(StatusPolicy::Strict)?;
        for region in &mut self.regions {
            match region.kind() {
                MemoryKind::Flash => region.note_erased(),
                MemoryKind::Eeprom => region.invalidate(),
                _ => {}
            }
        }
        log::info!("Chip erased");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Paged memories
    // ------------------------------------------------------------------

    fn paged_access(&self, kind: MemoryKind) -> Result<PagedAccess> {
        let desc = self.part.require_region(kind)?;
        let (read_cmd, program_cmd, read, write) = match kind {
            MemoryKind::Flash => (
                CMD_READ_FLASH_ISP,
                CMD_PROGRAM_FLASH_ISP,
                Operation::ReadLo,
                Operation::WriteLo,
            ),
            MemoryKind::Eeprom => (
                CMD_READ_EEPROM_ISP,
                CMD_PROGRAM_EEPROM_ISP,
                Operation::Read,
                Operation::Write,
            ),
            _ => {
                return Err(Stk500Error::Unsupported {
                    kind,
                    op: "page access",
                })
            }
        };

        let (load_op, write_op) = if desc.mode & MODE_PAGED != 0 {
            (
                desc.require(Operation::LoadPageLo)?.build(0, 0)[0],
                desc.require(Operation::WritePage)?.build(0, 0)[0],
            )
        } else {
            (desc.require(write)?.build(0, 0)[0], 0)
        };

        Ok(PagedAccess {
            kind,
            page_size: desc.unit_size(),
            read_cmd,
            program_cmd,
            read_op: desc.require(read)?.build(0, 0)[0],
            mode: desc.mode | MODE_WRITE_PAGE,
            delay: desc.delay,
            load_op,
            write_op,
            readback: desc.readback,
            extended: kind == MemoryKind::Flash && desc.op(Operation::LoadExtAddr).is_some(),
            write_delay_us: desc.min_write_delay_us,
        })
    }

    /// Point the bootloader at byte address `addr` unless it already is
    fn load_address(&mut self, access: &PagedAccess, addr: u32) -> Result<()> {
        if self.next_address == Some((access.kind, addr)) && addr & 0xFFFF != 0 {
            return Ok(());
        }
        let value = if access.kind == MemoryKind::Flash {
            let ext = if access.extended {
                LOAD_EXTENDED_ADDRESS
            } else {
                0
            };
            ext | (addr >> 1)
        } else {
            addr
        };
        let mut request = [CMD_LOAD_ADDRESS, 0, 0, 0, 0];
        request[1..].copy_from_slice(&value.to_be_bytes());
        self.command(&request, 16)?;
        self.next_address = Some((access.kind, addr));
        Ok(())
    }

    /// Read page `page` from the device without touching the region
    fn fetch_page(&mut self, access: &PagedAccess, page: u32) -> Result<Vec<u8>> {
        let addr = page * access.page_size;
        let len = access.page_size as usize;
        let [len_hi, len_lo] = (len as u16).to_be_bytes();
        let request = [access.read_cmd, len_hi, len_lo, access.read_op];

        self.with_retry(|s| {
            s.load_address(access, addr)?;
            let answer = s.command(&request, len + 3)?;
            if answer.len() != len + 3 || answer[len + 2] != Status::Ok.to_u8() {
                return Err(Stk500Error::UnexpectedResponse {
                    command: access.read_cmd,
                });
            }
            s.next_address = Some((access.kind, addr + len as u32));
            Ok(answer[2..2 + len].to_vec())
        })
    }

    /// Program page `page` with `data` without touching the region
    fn program_page(&mut self, access: &PagedAccess, page: u32, data: &[u8]) -> Result<()> {
        let addr = page * access.page_size;
        let [len_hi, len_lo] = (data.len() as u16).to_be_bytes();
        let mut request = vec![
            access.program_cmd,
            len_hi,
            len_lo,
            access.mode,
            access.delay,
            access.load_op,
            access.write_op,
            access.read_op,
            access.readback[0],
            access.readback[1],
        ];
        request.extend_from_slice(data);

        self.with_retry(|s| {
            s.load_address(access, addr)?;
            s.command(&request, 16)?;
            s.next_address = Some((access.kind, addr + data.len() as u32));
            Ok(())
        })?;
        self.delay(Duration::from_micros(access.write_delay_us as u64));
        Ok(())
    }

    fn page_data(&self, kind: MemoryKind, page: u32) -> Result<Vec<u8>> {
        let region = self.region(kind)?;
        let range = region.descriptor().unit_range(page);
        Ok(region.data()?[range].to_vec())
    }

    /// Read page `page` of `kind` into its region
    pub fn read_page(&mut self, kind: MemoryKind, page: u32) -> Result<()> {
        // Bounds check before touching the wire
        let addr = self.region(kind)?.unit_address(page)?;
        let access = self.paged_access(kind)?;
        self.ensure_program_mode()?;

        let data = self.fetch_page(&access, page)?;
        self.region_mut(kind)?.load(addr, &data)?;
        Ok(())
    }

    /// Write page `page` of `kind` from its region, dirty or not
    pub fn write_page(&mut self, kind: MemoryKind, page: u32) -> Result<()> {
        self.region(kind)?.unit_address(page)?;
        let access = self.paged_access(kind)?;
        let data = self.page_data(kind, page)?;
        self.ensure_program_mode()?;
        self.program_page(&access, page, &data)?;
        self.region_mut(kind)?.confirm_page(page)?;
        Ok(())
    }

    /// Prepare flash for a bootloader with the erase-pointer defect
    ///
    /// Pages `0..=max` not yet mirrored are read first so rewriting them
    /// preserves their content, then the erase pointer is rewound and all of
    /// them are marked for writing.
    fn rewind_erase_pointer(&mut self, access: &PagedAccess, max: u32) -> Result<()> {
        log::debug!("Erase-pointer workaround: writing pages 0..={}", max);
        for page in 0..=max {
            if !self.region(access.kind)?.is_loaded(page)? {
                let data = self.fetch_page(access, page)?;
                self.region_mut(access.kind)?
                    .load(page * access.page_size, &data)?;
            }
        }
        // The affected bootloader answers FAILED but still rewinds
        self.erase_with(StatusPolicy::Accept)?;
        let region = self.region_mut(access.kind)?;
        for page in 0..=max {
            region.mark_page_dirty(page)?;
        }
        Ok(())
    }

    fn write_pages(&mut self, kind: MemoryKind, verify: bool) -> Result<usize> {
        let access = self.paged_access(kind)?;
        if kind == MemoryKind::Flash && self.flags.contains(SessionFlags::ERASE_QUIRK) {
            if let Some(max) = self.region(kind)?.max_dirty_page() {
                self.rewind_erase_pointer(&access, max)?;
            }
        }

        let pages = self.region(kind)?.dirty_pages()?;
        self.state = SessionState::Writing;
        self.progress
            .writing(kind, pages.len() * access.page_size as usize);

        for (n, &page) in pages.iter().enumerate() {
            let addr = page * access.page_size;
            // Merge the device content so untouched bytes survive the rewrite
            if !self.region(kind)?.is_loaded(page)? {
                let current = self.fetch_page(&access, page)?;
                self.region_mut(kind)?.load(addr, &current)?;
                if !self.region(kind)?.is_page_dirty(addr)? {
                    continue;
                }
            }
            let data = self.page_data(kind, page)?;
            self.program_page(&access, page, &data)?;
            if verify {
                let readback = self.fetch_page(&access, page)?;
                if let Some(offset) = first_mismatch(&data, &readback) {
                    return Err(Stk500Error::VerifyFailed {
                        kind,
                        addr: addr + offset as u32,
                        expected: data[offset],
                        found: readback[offset],
                    });
                }
            }
            self.region_mut(kind)?.confirm_page(page)?;
            self.progress
                .write_progress((n + 1) * access.page_size as usize);
        }
        self.progress.complete();
        Ok(pages.len())
    }

    // ------------------------------------------------------------------
    // Unpaged memories
    // ------------------------------------------------------------------

    fn byte_access(&self, kind: MemoryKind) -> Result<ByteAccess> {
        let desc = self.part.require_region(kind)?;
        let (read_cmd, program_cmd) = match kind {
            MemoryKind::LFuse | MemoryKind::HFuse | MemoryKind::EFuse => {
                (CMD_READ_FUSE_ISP, Some(CMD_PROGRAM_FUSE_ISP))
            }
            MemoryKind::Lock => (CMD_READ_LOCK_ISP, Some(CMD_PROGRAM_LOCK_ISP)),
            MemoryKind::Signature => (CMD_READ_SIGNATURE_ISP, None),
            MemoryKind::Calibration => (CMD_READ_OSCCAL_ISP, None),
            MemoryKind::Flash | MemoryKind::Eeprom => {
                return Err(Stk500Error::Unsupported {
                    kind,
                    op: "single byte access",
                })
            }
        };
        Ok(ByteAccess {
            kind,
            read_cmd,
            program_cmd,
            read: desc.op(Operation::Read).copied(),
            write: desc.op(Operation::Write).copied(),
            write_delay_us: desc.max_write_delay_us,
        })
    }

    fn fetch_byte(&mut self, access: &ByteAccess, addr: u32) -> Result<u8> {
        let template = access
            .read
            .ok_or(stkflash_core::Error::MissingOperation {
                kind: access.kind,
                op: Operation::Read,
            })?;
        let ret_addr = template.output_byte_index().map_or(4, |i| i + 1) as u8;
        let mut request = vec![access.read_cmd, ret_addr];
        request.extend_from_slice(&template.build(addr, 0));

        self.with_retry(|s| {
            let answer = s.command(&request, 16)?;
            answer
                .get(2)
                .copied()
                .ok_or(Stk500Error::UnexpectedResponse {
                    command: access.read_cmd,
                })
        })
    }

    fn program_byte(&mut self, access: &ByteAccess, addr: u32, value: u8) -> Result<()> {
        let (Some(command), Some(template)) = (access.program_cmd, access.write) else {
            return Err(Stk500Error::ReadOnly(access.kind));
        };
        let mut request = vec![command];
        request.extend_from_slice(&template.build(addr, value));

        self.with_retry(|s| s.command(&request, 16))?;
        self.delay(Duration::from_micros(access.write_delay_us as u64));
        Ok(())
    }

    fn write_bytes(&mut self, kind: MemoryKind, verify: bool) -> Result<usize> {
        let access = self.byte_access(kind)?;
        let addrs = self.region(kind)?.dirty_pages()?;
        self.state = SessionState::Writing;
        self.progress.writing(kind, addrs.len());

        for (n, &addr) in addrs.iter().enumerate() {
            let value = self.region(kind)?.get(addr)?;
            self.program_byte(&access, addr, value)?;
            if verify {
                let found = self.fetch_byte(&access, addr)?;
                if found != value {
                    return Err(Stk500Error::VerifyFailed {
                        kind,
                        addr,
                        expected: value,
                        found,
                    });
                }
            }
            self.region_mut(kind)?.confirm_byte(addr)?;
            self.progress.write_progress(n + 1);
        }
        self.progress.complete();
        Ok(addrs.len())
    }

    /// Read one byte from the device
    ///
    /// Paged memories read the whole page holding `addr`.
    pub fn read_byte(&mut self, kind: MemoryKind, addr: u32) -> Result<u8> {
        self.ensure_program_mode()?;
        let region = self.region(kind)?;
        region.get(addr)?;
        if region.is_paged() {
            let page = region.descriptor().unit_of(addr);
            self.read_page(kind, page)?;
            return Ok(self.region(kind)?.get(addr)?);
        }

        let access = self.byte_access(kind)?;
        let value = self.fetch_byte(&access, addr)?;
        self.region_mut(kind)?.load(addr, &[value])?;
        Ok(value)
    }

    /// Store `value` at `addr` and write it to the device if it changed
    ///
    /// Paged memories rewrite the whole page holding `addr`.
    pub fn write_byte(&mut self, kind: MemoryKind, addr: u32, value: u8) -> Result<()> {
        if kind.is_read_only() {
            return Err(Stk500Error::ReadOnly(kind));
        }
        self.ensure_program_mode()?;
        let region = self.region(kind)?;
        region.get(addr)?;
        let paged = region.is_paged();
        let unit = region.descriptor().unit_of(addr);

        if !self.region(kind)?.is_loaded(unit)? {
            if paged {
                self.read_page(kind, unit)?;
            } else {
                self.read_byte(kind, addr)?;
            }
        }
        if !self.region_mut(kind)?.set(addr, value)? && !self.region(kind)?.is_byte_dirty(addr)? {
            log::debug!("{} 0x{:04X} already 0x{:02X}", kind, addr, value);
            return Ok(());
        }

        if paged {
            return self.write_page(kind, unit);
        }
        let access = self.byte_access(kind)?;
        self.program_byte(&access, addr, value)?;
        self.region_mut(kind)?.confirm_byte(addr)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Whole regions
    // ------------------------------------------------------------------

    /// Read the whole memory into its region and return the image
    ///
    /// Pages already mirrored are not read again.
    pub fn read_region(&mut self, kind: MemoryKind) -> Result<&[u8]> {
        self.ensure_program_mode()?;
        let result = self.read_units(kind);
        self.settle();
        result?;
        Ok(self.region(kind)?.data()?)
    }

    fn read_units(&mut self, kind: MemoryKind) -> Result<()> {
        self.state = SessionState::Reading;
        let desc = self.region(kind)?.descriptor().clone();
        self.progress.reading(kind, desc.size as usize);

        for unit in 0..desc.unit_count() {
            if !self.region(kind)?.is_loaded(unit)? {
                if desc.is_paged() {
                    self.read_page(kind, unit)?;
                } else {
                    self.read_byte(kind, unit)?;
                }
            }
            self.progress.read_progress(desc.unit_range(unit).end);
        }
        self.progress.complete();
        Ok(())
    }

    /// Write every dirty page (or byte) of `kind`
    ///
    /// With `verify`, each page is read back right after writing; a
    /// mismatch stops the write with [`Stk500Error::VerifyFailed`] and the
    /// page stays dirty. Returns the number of pages (or bytes) written.
    pub fn write_region(&mut self, kind: MemoryKind, verify: bool) -> Result<usize> {
        if kind.is_read_only() {
            return Err(Stk500Error::ReadOnly(kind));
        }
        self.ensure_program_mode()?;
        if !self.region(kind)?.has_changes() {
            log::info!("{}: nothing to write", kind);
            return Ok(0);
        }

        let result = if self.region(kind)?.is_paged() {
            self.write_pages(kind, verify)
        } else {
            self.write_bytes(kind, verify)
        };
        self.settle();
        if let Ok(n) = result {
            log::info!("{}: wrote {} unit(s)", kind, n);
        }
        result
    }

    /// Re-read everything written this session and compare with the buffer
    ///
    /// Mismatching pages (or bytes) are marked dirty again and the first
    /// mismatch is reported. Nothing is retried.
    pub fn verify(&mut self, kind: MemoryKind) -> Result<()> {
        self.ensure_program_mode()?;
        let result = self.verify_units(kind);
        self.settle();
        result
    }

    fn verify_units(&mut self, kind: MemoryKind) -> Result<()> {
        self.state = SessionState::Verifying;
        let region = self.region(kind)?;
        let units = region.written_pages()?;
        let paged = region.is_paged();
        let unit_size = region.descriptor().unit_size();
        self.progress
            .verifying(kind, units.len() * unit_size as usize);

        let mut first = None;
        for (n, &unit) in units.iter().enumerate() {
            let expected = self.page_data(kind, unit)?;
            let found = if paged {
                let access = self.paged_access(kind)?;
                self.fetch_page(&access, unit)?
            } else {
                let access = self.byte_access(kind)?;
                vec![self.fetch_byte(&access, unit)?]
            };
            if let Some(offset) = first_mismatch(&expected, &found) {
                log::warn!("{}: unit {} differs from the buffer", kind, unit);
                self.region_mut(kind)?.mark_page_dirty(unit)?;
                first.get_or_insert(Stk500Error::VerifyFailed {
                    kind,
                    addr: unit * unit_size + offset as u32,
                    expected: expected[offset],
                    found: found[offset],
                });
            }
            self.progress.verify_progress((n + 1) * unit_size as usize);
        }
        self.progress.complete();
        first.map_or(Ok(()), Err)
    }

    /// Compare the device against a firmware image, ignoring the buffers
    ///
    /// Returns the number of bytes compared.
    pub fn verify_image(&mut self, kind: MemoryKind, image: &HexImage) -> Result<usize> {
        self.ensure_program_mode()?;
        let result = self.verify_image_units(kind, image);
        self.settle();
        result
    }

    fn verify_image_units(&mut self, kind: MemoryKind, image: &HexImage) -> Result<usize> {
        self.state = SessionState::Verifying;
        let desc = self.region(kind)?.descriptor().clone();
        image.check_fits(desc.size)?;

        let mut expected = vec![None; desc.size as usize];
        for (addr, value) in image.bytes() {
            expected[addr as usize] = Some(value);
        }
        let units: BTreeSet<u32> = image.bytes().map(|(a, _)| desc.unit_of(a)).collect();
        self.progress.verifying(kind, image.byte_count());

        let mut compared = 0;
        for unit in units {
            let range = desc.unit_range(unit);
            let found = if desc.is_paged() {
                let access = self.paged_access(kind)?;
                self.fetch_page(&access, unit)?
            } else {
                let access = self.byte_access(kind)?;
                vec![self.fetch_byte(&access, unit)?]
            };
            for (offset, device) in found.iter().enumerate() {
                let addr = range.start + offset;
                if let Some(want) = expected[addr] {
                    if want != *device {
                        return Err(Stk500Error::VerifyFailed {
                            kind,
                            addr: addr as u32,
                            expected: want,
                            found: *device,
                        });
                    }
                    compared += 1;
                }
            }
            self.progress.verify_progress(compared);
        }
        self.progress.complete();
        Ok(compared)
    }

    /// Parse an Intel HEX image and merge it into the region of `kind`
    pub fn load_hex(&mut self, kind: MemoryKind, text: &str) -> Result<IngestStats> {
        let image = HexImage::parse(text)?;
        self.load_image(kind, &image)
    }

    /// Merge a parsed image into the region of `kind`
    ///
    /// Every page the image touches is read from the device first, so only
    /// bytes that actually differ end up dirty.
    pub fn load_image(&mut self, kind: MemoryKind, image: &HexImage) -> Result<IngestStats> {
        if kind.is_read_only() {
            return Err(Stk500Error::ReadOnly(kind));
        }
        let region = self.region(kind)?;
        image.check_fits(region.size())?;
        let desc = region.descriptor().clone();

        self.ensure_program_mode()?;
        let units: BTreeSet<u32> = image.bytes().map(|(a, _)| desc.unit_of(a)).collect();
        for unit in units {
            if !self.region(kind)?.is_loaded(unit)? {
                if desc.is_paged() {
                    self.read_page(kind, unit)?;
                } else {
                    self.read_byte(kind, unit)?;
                }
            }
        }

        let stats = image.apply(self.region_mut(kind)?)?;
        log::info!(
            "{}: {} bytes from {} records, {} changed",
            kind,
            stats.bytes,
            stats.records,
            stats.changed
        );
        Ok(stats)
    }

    /// Read the device signature and check it against the part
    pub fn read_signature(&mut self) -> Result<[u8; 3]> {
        let mut signature = [0u8; 3];
        for (addr, byte) in signature.iter_mut().enumerate() {
            *byte = self.read_byte(MemoryKind::Signature, addr as u32)?;
        }
        if signature != self.part.signature {
            return Err(Stk500Error::SignatureMismatch {
                expected: self.part.signature,
                found: signature,
            });
        }
        Ok(signature)
    }
}

impl<T: Transport, R: ResetLine> Drop for ProgrammingSession<T, R> {
    fn drop(&mut self) {
        if self.flags.contains(SessionFlags::PROGRAM_MODE)
            && !self.flags.contains(SessionFlags::ABORTED)
        {
            if let Err(e) = self.leave_program_mode() {
                log::debug!("Leaving programming mode on drop failed: {}", e);
            }
        }
    }
}
