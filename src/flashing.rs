//! The programming engine.
//!
//! A run walks `Idle → EnteringProgrammingMode → Erasing →
//! ApplyingProgrammingFuses → WritingFlash → Verifying → ApplyingNormalFuses →
//! ExitingProgrammingMode → Done`, or drops into `Aborted`. Normal fuses go in
//! last: they may re-lock the target, so they are only written once the flash
//! content has been confirmed.
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use indicatif::ProgressBar;

use crate::{
    config::ProgrammingConfig,
    constants::ATMEL_VENDOR_CODE,
    device::{DeviceDescriptor, FuseSet},
    error::{DeviceState, Error, Result},
    format::{ImageDecoder, Payload},
    fuses::FuseProgrammer,
    page::{FlashPageWriter, Page, PageCommit},
    protocol::Command,
    transport::IspBus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    EnteringProgrammingMode,
    Erasing,
    ApplyingProgrammingFuses,
    WritingFlash,
    Verifying,
    ApplyingNormalFuses,
    ExitingProgrammingMode,
    Done,
    Aborted,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Aborted)
    }
}

/// External request to stop a run, honoured at page and fuse boundaries.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connect_attempts: u32,
    pub pages_written: usize,
    pub bytes_written: usize,
    pub page_retries: u32,
    pub pages_verified: usize,
}

/// Outcome of one programming run.
#[derive(Debug)]
pub struct SessionResult {
    /// `Done` or `Aborted`.
    pub state: State,
    pub device_state: DeviceState,
    pub failure: Option<Error>,
    pub stats: SessionStats,
    /// Every state the engine went through, in order.
    pub trace: Vec<State>,
}

impl SessionResult {
    pub fn is_success(&self) -> bool {
        self.state == State::Done
    }

    pub fn into_result(self) -> Result<SessionStats> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.stats),
        }
    }
}

impl fmt::Display for SessionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            None => write!(
                f,
                "done: {} pages, {} bytes written",
                self.stats.pages_written, self.stats.bytes_written
            ),
            Some(err) => write!(f, "aborted: {} (device {})", err, self.device_state),
        }
    }
}

pub struct Programmer<B: IspBus> {
    bus: B,
    config: ProgrammingConfig,
    abort: AbortSignal,
    image_dir: PathBuf,
    progress: Option<ProgressBar>,
}

impl<B: IspBus> Programmer<B> {
    pub fn new(bus: B, config: ProgrammingConfig) -> Self {
        Programmer {
            bus,
            config,
            abort: AbortSignal::new(),
            image_dir: PathBuf::from("."),
            progress: None,
        }
    }

    /// Directory catalog payload paths are relative to.
    pub fn with_image_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.image_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Handle to cancel runs of this programmer from elsewhere.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn config(&self) -> &ProgrammingConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Loads the descriptor's payload and programs it.
    pub fn run(&mut self, descriptor: &DeviceDescriptor, verify: bool) -> SessionResult {
        match Payload::load(&descriptor.payload, &self.image_dir) {
            Ok(payload) => self.run_with_payload(descriptor, &payload, verify),
            Err(err) => {
                log::error!("Cannot load image for {}: {}", descriptor.name, err);
                SessionResult {
                    state: State::Aborted,
                    device_state: DeviceState::Untouched,
                    failure: Some(err),
                    stats: SessionStats::default(),
                    trace: vec![State::Idle, State::Aborted],
                }
            }
        }
    }

    pub fn run_with_payload(
        &mut self,
        descriptor: &DeviceDescriptor,
        payload: &Payload,
        verify: bool,
    ) -> SessionResult {
        let mut session = Session::new(
            &mut self.bus,
            descriptor,
            &self.config,
            &self.abort,
            self.progress.clone(),
        );
        let outcome = session.program(payload, verify);
        session.finish(outcome)
    }

    /// Compares the target's flash with a payload without writing anything.
    pub fn verify_image(&mut self, descriptor: &DeviceDescriptor, payload: &Payload) -> Result<()> {
        let mut session = Session::new(
            &mut self.bus,
            descriptor,
            &self.config,
            &self.abort,
            self.progress.clone(),
        );
        let outcome = session.compare(payload);
        session.finish(outcome).into_result().map(|_| ())
    }

    /// Writes the programming or the normal fuse set of a descriptor.
    pub fn write_fuses(&mut self, descriptor: &DeviceDescriptor, normal: bool) -> Result<()> {
        let mut session = Session::new(
            &mut self.bus,
            descriptor,
            &self.config,
            &self.abort,
            self.progress.clone(),
        );
        let outcome = session.apply_fuses(normal);
        session.finish(outcome).into_result().map(|_| ())
    }

    /// Enters programming mode and returns the three signature bytes,
    /// whatever the target is.
    pub fn identify(&mut self) -> Result<[u8; 3]> {
        let mut attempts = 0;
        connect(&mut self.bus, &self.config, None, &mut attempts)
    }

    pub fn read_fuses(&mut self) -> Result<FuseSet> {
        FuseProgrammer::from_config(&self.config).read_fuses(&mut self.bus)
    }

    /// Reads `len` bytes of flash from byte address `start`; needs programming mode.
    pub fn read_flash(&mut self, start: u32, len: u32) -> Result<Vec<u8>> {
        let mut bank = None;
        read_bytes(&mut self.bus, &mut bank, start, len)?.ok_or_else(|| {
            Error::transport(anyhow::anyhow!(
                "target refused the flash bank holding 0x{:05x}",
                start
            ))
        })
    }

    /// Releases RESET, letting the target run.
    pub fn release(&mut self) -> Result<()> {
        self.bus.set_reset(false).map_err(Error::transport)
    }
}

/// Transient state of one run.
struct Session<'a, B: IspBus> {
    bus: &'a mut B,
    descriptor: &'a DeviceDescriptor,
    config: &'a ProgrammingConfig,
    abort: &'a AbortSignal,
    progress: Option<ProgressBar>,
    fuses: FuseProgrammer,
    state: State,
    device_state: DeviceState,
    trace: Vec<State>,
    stats: SessionStats,
    /// Currently selected 64K-word flash bank.
    bank: Option<u8>,
    committed: Vec<Page>,
}

impl<'a, B: IspBus> Session<'a, B> {
    fn new(
        bus: &'a mut B,
        descriptor: &'a DeviceDescriptor,
        config: &'a ProgrammingConfig,
        abort: &'a AbortSignal,
        progress: Option<ProgressBar>,
    ) -> Self {
        Session {
            bus,
            descriptor,
            config,
            abort,
            progress,
            fuses: FuseProgrammer::from_config(config),
            state: State::Idle,
            device_state: DeviceState::Untouched,
            trace: vec![State::Idle],
            stats: SessionStats::default(),
            bank: None,
            committed: vec![],
        }
    }

    fn transition(&mut self, next: State) {
        log::debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
        self.trace.push(next);
    }

    fn program(&mut self, payload: &Payload, verify: bool) -> Result<()> {
        let decoder = ImageDecoder::new(payload)?;
        let pages = self.preflight(&decoder)?;
        log::info!(
            "Programming {} with {} pages of {} bytes",
            self.descriptor,
            pages,
            self.descriptor.page_bytes()
        );

        self.transition(State::EnteringProgrammingMode);
        self.enter()?;

        self.transition(State::Erasing);
        self.erase()?;

        self.abort.check()?;
        self.transition(State::ApplyingProgrammingFuses);
        self.device_state = DeviceState::ProgrammingFusesOnly;
        self.fuses.write_set(
            self.bus,
            &self.descriptor.programming_fuses,
            &self.config.fuse_order,
            self.abort,
        )?;

        self.transition(State::WritingFlash);
        if let Some(pb) = &self.progress {
            pb.set_length(pages as u64);
            pb.set_position(0);
        }
        self.write_flash(&decoder)?;

        if verify {
            self.transition(State::Verifying);
            if let Some(pb) = &self.progress {
                pb.set_position(0);
            }
            self.verify_flash(true)?;
        }
        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        self.device_state = DeviceState::FlashWrittenFusesPending;

        self.transition(State::ApplyingNormalFuses);
        self.fuses.write_set(
            self.bus,
            &self.descriptor.normal_fuses,
            &self.config.fuse_order,
            self.abort,
        )?;
        self.device_state = DeviceState::Done;

        self.exit()
    }

    /// Read-only comparison of flash against a payload.
    fn compare(&mut self, payload: &Payload) -> Result<()> {
        let decoder = ImageDecoder::new(payload)?;
        self.preflight(&decoder)?;
        self.transition(State::EnteringProgrammingMode);
        self.enter()?;

        let mut writer = FlashPageWriter::new(self.descriptor.page_bytes(), self.config.pad_byte)?;
        let mut pages = vec![];
        let mut collect = |page: &Page| -> Result<()> {
            pages.push(page.clone());
            Ok(())
        };
        for item in decoder.iter() {
            let (address, byte) = item?;
            writer.push(address, byte, &mut collect)?;
        }
        writer.finish(&mut collect)?;
        self.committed = pages;

        self.transition(State::Verifying);
        self.verify_flash(false)?;
        self.exit()
    }

    fn apply_fuses(&mut self, normal: bool) -> Result<()> {
        self.transition(State::EnteringProgrammingMode);
        self.enter()?;
        let (next, set) = if normal {
            (State::ApplyingNormalFuses, self.descriptor.normal_fuses)
        } else {
            (
                State::ApplyingProgrammingFuses,
                self.descriptor.programming_fuses,
            )
        };
        self.abort.check()?;
        self.transition(next);
        self.device_state = DeviceState::ProgrammingFusesOnly;
        self.fuses
            .write_set(self.bus, &set, &self.config.fuse_order, self.abort)?;
        if normal {
            self.device_state = DeviceState::Done;
        }
        self.exit()
    }

    /// Decodes the whole payload once without touching the bus, returns the
    /// number of pages it spans.
    fn preflight(&self, decoder: &ImageDecoder<'_>) -> Result<usize> {
        self.descriptor.validate()?;
        let page_bytes = self.descriptor.page_bytes();
        let flash_size = self.descriptor.flash_size;
        let mut pages = 0;
        let mut count = |page: &Page| -> Result<()> {
            if let Some(size) = flash_size {
                if page.address + page_bytes > size {
                    return Err(Error::malformed(format!(
                        "image reaches 0x{:04x}, beyond the {} byte flash",
                        page.address + page_bytes,
                        size
                    )));
                }
            }
            pages += 1;
            Ok(())
        };

        let mut writer = FlashPageWriter::new(page_bytes, self.config.pad_byte)?;
        for item in decoder.iter() {
            let (address, byte) = item?;
            writer.push(address, byte, &mut count)?;
        }
        writer.finish(&mut count)?;
        if pages == 0 {
            return Err(Error::malformed("payload holds no data"));
        }
        Ok(pages)
    }

    fn enter(&mut self) -> Result<()> {
        let expected = self.descriptor.signature;
        connect(
            self.bus,
            self.config,
            Some(expected),
            &mut self.stats.connect_attempts,
        )?;
        log::info!("Found {}", self.descriptor);
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.device_state = DeviceState::Erased;
        let resp = self
            .bus
            .transfer(Command::ChipErase)
            .map_err(Error::transport)?;
        if !resp.is_ok() {
            log::error!("Chip erase not acknowledged: {:?}", resp);
            return Err(Error::EraseFault);
        }
        self.bus.delay_ms(self.config.erase_delay_ms);
        log::info!("Flash erased");
        Ok(())
    }

    fn write_flash(&mut self, decoder: &ImageDecoder<'_>) -> Result<()> {
        let mut writer = FlashPageWriter::new(self.descriptor.page_bytes(), self.config.pad_byte)?;
        for item in decoder.iter() {
            let (address, byte) = item?;
            writer.push(address, byte, self)?;
        }
        writer.finish(self)?;
        log::info!(
            "Wrote {} bytes in {} pages",
            self.stats.bytes_written,
            self.stats.pages_written
        );
        Ok(())
    }

    /// Loads the page buffer and commits it once. `PageWriteFault` when the
    /// target falls out of sync.
    fn write_page(&mut self, page: &Page) -> Result<()> {
        let fault = || Error::PageWriteFault {
            address: page.address,
            attempts: 1,
        };
        let base = page.word_address();
        if !select_bank(self.bus, &mut self.bank, base)? {
            return Err(fault());
        }
        for (i, word) in page.data.chunks(2).enumerate() {
            let address = (base + i as u32) as u16;
            for (high, &value) in word.iter().enumerate() {
                let resp = self
                    .bus
                    .transfer(Command::load_page(address, high == 1, value))
                    .map_err(Error::transport)?;
                if !resp.is_ok() {
                    return Err(fault());
                }
            }
        }
        let resp = self
            .bus
            .transfer(Command::WritePage { word: base as u16 })
            .map_err(Error::transport)?;
        if !resp.is_ok() {
            return Err(fault());
        }
        self.bus.delay_ms(self.config.page_write_delay_ms);
        Ok(())
    }

    /// Reads back every committed page. With `rewrite`, a mismatching page is
    /// written again within the per-page retry bound.
    fn verify_flash(&mut self, rewrite: bool) -> Result<()> {
        let pages = std::mem::take(&mut self.committed);
        let attempts = self.config.page_retries + 1;
        for page in &pages {
            self.abort.check()?;
            let mut matched = false;
            for attempt in 1..=attempts {
                let read = read_bytes(self.bus, &mut self.bank, page.address, page.data.len() as u32)?;
                if read.as_deref() == Some(&page.data[..]) {
                    matched = true;
                    break;
                }
                log::warn!(
                    "Verify mismatch at 0x{:04x} (attempt {}/{})",
                    page.address,
                    attempt,
                    attempts
                );
                if !rewrite {
                    break;
                }
                if attempt < attempts {
                    self.stats.page_retries += 1;
                    match self.write_page(page) {
                        Ok(()) => (),
                        Err(Error::PageWriteFault { .. }) => log::warn!(
                            "Rewrite of page 0x{:04x} not acknowledged",
                            page.address
                        ),
                        Err(err) => return Err(err),
                    }
                }
            }
            if !matched {
                return Err(Error::VerifyMismatch {
                    address: page.address,
                    attempts: if rewrite { attempts } else { 1 },
                });
            }
            self.stats.pages_verified += 1;
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }
        self.committed = pages;
        log::info!("Verified {} pages", self.stats.pages_verified);
        Ok(())
    }

    fn exit(&mut self) -> Result<()> {
        self.transition(State::ExitingProgrammingMode);
        self.bus.set_reset(false).map_err(Error::transport)?;
        self.transition(State::Done);
        Ok(())
    }

    fn finish(mut self, outcome: Result<()>) -> SessionResult {
        let failure = match outcome {
            Ok(()) => None,
            Err(err) => {
                log::error!(
                    "Aborted in {:?}: {} (device {})",
                    self.state,
                    err,
                    self.device_state
                );
                if self.state != State::Idle {
                    if let Err(e) = self.bus.set_reset(false) {
                        log::warn!("Failed to release reset: {:#}", e);
                    }
                }
                if let Some(pb) = &self.progress {
                    pb.abandon();
                }
                self.transition(State::Aborted);
                Some(err)
            }
        };
        SessionResult {
            state: self.state,
            device_state: self.device_state,
            failure,
            stats: self.stats,
            trace: self.trace,
        }
    }
}

impl<B: IspBus> PageCommit for Session<'_, B> {
    /// Writes one page, retrying up to the configured bound.
    fn commit(&mut self, page: &Page) -> Result<()> {
        self.abort.check()?;
        let attempts = self.config.page_retries + 1;
        for attempt in 1..=attempts {
            match self.write_page(page) {
                Ok(()) => {
                    self.stats.pages_written += 1;
                    self.stats.bytes_written += page.data.len();
                    self.committed.push(page.clone());
                    if let Some(pb) = &self.progress {
                        pb.inc(1);
                    }
                    return Ok(());
                }
                Err(Error::PageWriteFault { .. }) => {
                    log::warn!(
                        "Page write failed at 0x{:04x} (attempt {}/{})",
                        page.address,
                        attempt,
                        attempts
                    );
                    if attempt < attempts {
                        self.stats.page_retries += 1;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::PageWriteFault {
            address: page.address,
            attempts,
        })
    }
}

/// Pulses RESET and enables programming, retrying until the target answers in
/// sync and, when `expected` is given, reports that signature.
fn connect<B: IspBus + ?Sized>(
    bus: &mut B,
    config: &ProgrammingConfig,
    expected: Option<u16>,
    attempts: &mut u32,
) -> Result<[u8; 3]> {
    bus.set_prescaler(config.prescaler)
        .map_err(Error::transport)?;
    let mut found = 0;
    for attempt in 1..=config.connect_attempts {
        *attempts = attempt;
        bus.set_reset(false).map_err(Error::transport)?;
        bus.delay_ms(config.reset_settle_ms);
        bus.set_reset(true).map_err(Error::transport)?;
        bus.delay_ms(config.reset_settle_ms);

        let resp = bus
            .transfer(Command::ProgrammingEnable)
            .map_err(Error::transport)?;
        if resp.is_ok() {
            let signature = read_signature(bus)?;
            found = u16::from_be_bytes([signature[1], signature[2]]);
            if signature[0] != ATMEL_VENDOR_CODE {
                log::warn!("Unexpected vendor code 0x{:02x}", signature[0]);
            }
            match expected {
                None => return Ok(signature),
                Some(expected) if expected == found => return Ok(signature),
                Some(expected) => log::warn!(
                    "Signature 0x{:04x} does not match 0x{:04x} (attempt {}/{})",
                    found,
                    expected,
                    attempt,
                    config.connect_attempts
                ),
            }
        } else {
            log::warn!(
                "Target not in sync: {:?} (attempt {}/{})",
                resp,
                attempt,
                config.connect_attempts
            );
        }
        if attempt < config.connect_attempts {
            bus.delay_ms(config.connect_retry_delay_ms);
        }
    }
    Err(Error::DeviceNotDetected {
        expected: expected.unwrap_or_default(),
        found,
    })
}

pub fn read_signature<B: IspBus + ?Sized>(bus: &mut B) -> Result<[u8; 3]> {
    let mut signature = [0u8; 3];
    for (index, byte) in signature.iter_mut().enumerate() {
        *byte = bus
            .transfer(Command::ReadSignature { index: index as u8 })
            .map_err(Error::transport)?
            .value();
    }
    Ok(signature)
}

/// Selects the flash bank holding `word` on parts beyond 64K words.
/// Returns `false` when the target did not acknowledge.
fn select_bank<B: IspBus + ?Sized>(bus: &mut B, bank: &mut Option<u8>, word: u32) -> Result<bool> {
    let high = (word >> 16) as u8;
    if *bank == Some(high) || (bank.is_none() && high == 0) {
        return Ok(true);
    }
    let resp = bus
        .transfer(Command::LoadExtendedAddress { high })
        .map_err(Error::transport)?;
    if resp.is_ok() {
        *bank = Some(high);
    }
    Ok(resp.is_ok())
}

/// Reads flash bytes, `None` when the target refused a bank switch.
fn read_bytes<B: IspBus + ?Sized>(
    bus: &mut B,
    bank: &mut Option<u8>,
    start: u32,
    len: u32,
) -> Result<Option<Vec<u8>>> {
    let mut data = Vec::with_capacity(len as usize);
    for address in start..start + len {
        let word = address / 2;
        if (word % 0x10000 == 0 || address == start) && !select_bank(bus, bank, word)? {
            log::warn!("Flash bank {} not acknowledged", word >> 16);
            return Ok(None);
        }
        let resp = bus
            .transfer(Command::read_program(word as u16, address % 2 == 1))
            .map_err(Error::transport)?;
        data.push(resp.value());
    }
    Ok(Some(data))
}
