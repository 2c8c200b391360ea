//! A simulated AVR target answering the ISP instruction set.
#![allow(dead_code)]

use std::collections::HashMap;

use avrisp::{
    AbortSignal, DeviceDescriptor, FuseCategory, FuseSet, IspBus, Payload, Prescaler,
    ProgrammingConfig,
    device::{PayloadFormat, PayloadRef},
};

pub const SIGNATURE: u16 = 0x950f;

pub struct SimulatedAvr {
    pub signature: [u8; 3],
    pub page_words: u32,
    pub flash: Vec<u8>,
    pub fuses: FuseSet,
    page_buffer: Vec<u8>,
    ext: u8,
    reset: bool,
    enabled: bool,
    pages_written: usize,

    pub frames: Vec<[u8; 4]>,
    pub reset_events: Vec<bool>,
    pub prescaler: Option<Prescaler>,

    /// Page byte address → write attempts still to fail (`u32::MAX` always fails).
    pub failing_pages: HashMap<u32, u32>,
    /// Bytes that always read back as the given value.
    pub stuck_bytes: HashMap<u32, u8>,
    /// Programming enable attempts answered out of sync.
    pub sync_failures: u32,
    /// Frames answered before the bus goes dead.
    pub transport_fail_after: Option<usize>,
    /// Raise the signal once this many pages were written.
    pub abort_after_pages: Option<(usize, AbortSignal)>,
    /// Fuse write (category, value) answered out of sync.
    pub nack_fuse: Option<(FuseCategory, u8)>,
    /// Refuse every page write once this many pages were written.
    pub page_writes_before_wearout: Option<usize>,
    /// Answer chip erase out of sync.
    pub nack_erase: bool,
    /// Answer load extended address out of sync.
    pub nack_bank_select: bool,
}

impl SimulatedAvr {
    pub fn new(signature: u16, page_words: u32, flash_size: usize) -> Self {
        let [s1, s2] = signature.to_be_bytes();
        SimulatedAvr {
            signature: [0x1e, s1, s2],
            page_words,
            flash: vec![0xff; flash_size],
            fuses: FuseSet::new(0xff, 0x62, 0xd9, 0xff),
            page_buffer: vec![0xff; page_words as usize * 2],
            ext: 0,
            reset: false,
            enabled: false,
            pages_written: 0,
            frames: vec![],
            reset_events: vec![],
            prescaler: None,
            failing_pages: HashMap::new(),
            stuck_bytes: HashMap::new(),
            sync_failures: 0,
            transport_fail_after: None,
            abort_after_pages: None,
            nack_fuse: None,
            page_writes_before_wearout: None,
            nack_erase: false,
            nack_bank_select: false,
        }
    }

    fn dead(&self) -> bool {
        self.transport_fail_after
            .is_some_and(|n| self.frames.len() > n)
    }

    fn fuse_write(frame: [u8; 4]) -> Option<FuseCategory> {
        match [frame[0], frame[1]] {
            [0xac, 0xe0] => Some(FuseCategory::Lock),
            [0xac, 0xa0] => Some(FuseCategory::Low),
            [0xac, 0xa8] => Some(FuseCategory::High),
            [0xac, 0xa4] => Some(FuseCategory::Extended),
            _ => None,
        }
    }

    fn fuse_read(frame: [u8; 4]) -> Option<FuseCategory> {
        match [frame[0], frame[1]] {
            [0x58, 0x00] => Some(FuseCategory::Lock),
            [0x50, 0x00] => Some(FuseCategory::Low),
            [0x58, 0x08] => Some(FuseCategory::High),
            [0x50, 0x08] => Some(FuseCategory::Extended),
            _ => None,
        }
    }
}

const OUT_OF_SYNC: [u8; 4] = [0xff; 4];

impl IspBus for SimulatedAvr {
    fn transact(&mut self, frame: [u8; 4]) -> anyhow::Result<[u8; 4]> {
        self.frames.push(frame);
        if self.dead() {
            anyhow::bail!("bridge timed out");
        }

        if frame[..2] == [0xac, 0x53] {
            if !self.reset {
                return Ok(OUT_OF_SYNC);
            }
            if self.sync_failures > 0 {
                self.sync_failures -= 1;
                return Ok(OUT_OF_SYNC);
            }
            self.enabled = true;
            return Ok([0x00, 0xac, 0x53, 0x00]);
        }
        if !self.enabled {
            return Ok(OUT_OF_SYNC);
        }

        let word = u16::from_be_bytes([frame[1], frame[2]]) as u32;
        let value = if let Some(category) = Self::fuse_write(frame) {
            if self.nack_fuse == Some((category, frame[3])) {
                return Ok([0x00, frame[0], 0xff, 0x00]);
            }
            let stored = match category {
                FuseCategory::Lock => frame[3] | 0xc0,
                _ => frame[3],
            };
            self.fuses.set(category, stored);
            frame[2]
        } else if let Some(category) = Self::fuse_read(frame) {
            self.fuses.get(category)
        } else {
            match frame[0] {
                0x30 => self.signature[(frame[2] & 0x03).min(2) as usize],
                0xac if frame[1] == 0x80 => {
                    if self.nack_erase {
                        return Ok([0x00, 0xac, 0xff, 0x00]);
                    }
                    self.flash.fill(0xff);
                    self.fuses.lock = 0xff;
                    frame[2]
                }
                0x40 | 0x48 => {
                    let offset = (word % self.page_words) as usize * 2;
                    let high = (frame[0] == 0x48) as usize;
                    self.page_buffer[offset + high] = frame[3];
                    frame[2]
                }
                0x4c => {
                    let full = ((self.ext as u32) << 16) | word;
                    let base = (full & !(self.page_words - 1)) * 2;
                    if self.page_writes_before_wearout.is_some_and(|n| self.pages_written >= n) {
                        return Ok([0x00, 0x4c, 0xff, 0x00]);
                    }
                    if let Some(remaining) = self.failing_pages.get_mut(&base) {
                        if *remaining > 0 {
                            if *remaining != u32::MAX {
                                *remaining -= 1;
                            }
                            return Ok([0x00, 0x4c, 0xff, 0x00]);
                        }
                    }
                    for (i, &b) in self.page_buffer.iter().enumerate() {
                        self.flash[base as usize + i] &= b;
                    }
                    self.page_buffer.fill(0xff);
                    self.pages_written += 1;
                    if let Some((n, signal)) = &self.abort_after_pages {
                        if self.pages_written == *n {
                            signal.abort();
                        }
                    }
                    frame[2]
                }
                0x20 | 0x28 => {
                    let address = (((self.ext as u32) << 16) | word) * 2 + (frame[0] == 0x28) as u32;
                    match self.stuck_bytes.get(&address) {
                        Some(&stuck) => stuck,
                        None => self.flash.get(address as usize).copied().unwrap_or(0xff),
                    }
                }
                0x4d => {
                    if self.nack_bank_select {
                        return Ok([0x00, 0x4d, 0xff, 0x00]);
                    }
                    self.ext = frame[2];
                    frame[2]
                }
                0xf0 => 0x00,
                _ => anyhow::bail!("unexpected frame {:02x?}", frame),
            }
        };
        Ok([0x00, frame[0], frame[1], value])
    }

    fn set_reset(&mut self, asserted: bool) -> anyhow::Result<()> {
        if self.dead() {
            anyhow::bail!("bridge timed out");
        }
        self.reset_events.push(asserted);
        self.reset = asserted;
        if !asserted {
            self.enabled = false;
        }
        Ok(())
    }

    fn set_prescaler(&mut self, prescaler: Prescaler) -> anyhow::Result<()> {
        self.prescaler = Some(prescaler);
        Ok(())
    }

    fn delay_ms(&mut self, _ms: u32) {}
}

pub fn programming_fuses() -> FuseSet {
    FuseSet::new(0x3f, 0xff, 0xde, 0xfd)
}

pub fn normal_fuses() -> FuseSet {
    FuseSet::new(0x2f, 0xe2, 0xde, 0xfd)
}

pub fn descriptor(page_size: u8, flash_size: Option<u32>) -> DeviceDescriptor {
    DeviceDescriptor {
        name: "blinky".into(),
        signature: SIGNATURE,
        programming_fuses: programming_fuses(),
        normal_fuses: normal_fuses(),
        page_size,
        flash_size,
        payload: PayloadRef {
            path: "blinky.hex".into(),
            format: Some(PayloadFormat::Hex),
        },
    }
}

pub fn config() -> ProgrammingConfig {
    ProgrammingConfig {
        connect_retry_delay_ms: 0,
        reset_settle_ms: 0,
        erase_delay_ms: 0,
        page_write_delay_ms: 0,
        fuse_write_delay_ms: 0,
        ..Default::default()
    }
}

/// Intel HEX text placing `data` at `address`.
pub fn hex_text(address: u32, data: &[u8]) -> String {
    let mut records = vec![];
    if address > 0xffff {
        records.push(ihex::Record::ExtendedLinearAddress((address >> 16) as u16));
    }
    for (i, chunk) in data.chunks(16).enumerate() {
        records.push(ihex::Record::Data {
            offset: (address as u16).wrapping_add(i as u16 * 16),
            value: chunk.to_vec(),
        });
    }
    records.push(ihex::Record::EndOfFile);
    ihex::create_object_file_representation(&records).unwrap()
}

pub fn hex_payload(address: u32, data: &[u8]) -> Payload {
    Payload::from_hex_str(&hex_text(address, data))
}

pub fn ramp(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 1) as u8).collect()
}

/// Word addresses of every write-page frame, in order.
pub fn page_writes(frames: &[[u8; 4]]) -> Vec<u32> {
    frames
        .iter()
        .filter(|f| f[0] == 0x4c)
        .map(|f| u16::from_be_bytes([f[1], f[2]]) as u32)
        .collect()
}

pub fn is_fuse_write(frame: &[u8; 4]) -> bool {
    frame[0] == 0xac && matches!(frame[1], 0xe0 | 0xa0 | 0xa8 | 0xa4)
}

pub fn is_flash_read(frame: &[u8; 4]) -> bool {
    matches!(frame[0], 0x20 | 0x28)
}
