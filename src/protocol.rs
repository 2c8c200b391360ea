//! The serial programming instruction set of AVR targets

use std::fmt;

use crate::{constants::commands, device::FuseCategory};

/// AVR ISP instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    /// Enable serial programming after RESET goes low.
    ///
    /// The target echoes `0x53` in the third byte when it is in sync.
    ProgrammingEnable,
    /// Erase flash and EEPROM, clearing the lock bits.
    ChipErase,
    /// Read signature byte 0, 1 or 2.
    ReadSignature { index: u8 },
    /// Select the 64K-word flash bank used by following page loads and writes.
    LoadExtendedAddress { high: u8 },
    /// Fill one byte of the page buffer.
    ///
    /// `word` is the word index inside the page; the low byte of a word must be
    /// loaded before its high byte.
    LoadPage { word: u16, high: bool, value: u8 },
    /// Commit the page buffer to the page holding word address `word`.
    WritePage { word: u16 },
    /// Read one byte of program memory at word address `word`.
    ReadProgram { word: u16, high: bool },
    WriteFuse { category: FuseCategory, value: u8 },
    ReadFuse { category: FuseCategory },
}

impl Command {
    pub fn load_page(word: u16, high: bool, value: u8) -> Self {
        Command::LoadPage { word, high, value }
    }

    pub fn read_program(word: u16, high: bool) -> Self {
        Command::ReadProgram { word, high }
    }

    pub fn write_fuse(category: FuseCategory, value: u8) -> Self {
        Command::WriteFuse { category, value }
    }

    pub fn read_fuse(category: FuseCategory) -> Self {
        Command::ReadFuse { category }
    }

    pub fn into_raw(self) -> [u8; 4] {
        match self {
            Command::ProgrammingEnable => {
                let [a, b] = commands::PROGRAMMING_ENABLE;
                [a, b, 0x00, 0x00]
            }
            Command::ChipErase => {
                let [a, b] = commands::CHIP_ERASE;
                [a, b, 0x00, 0x00]
            }
            Command::ReadSignature { index } => [commands::READ_SIGNATURE, 0x00, index & 0x03, 0x00],
            Command::LoadExtendedAddress { high } => {
                [commands::LOAD_EXTENDED_ADDRESS, 0x00, high, 0x00]
            }
            Command::LoadPage { word, high, value } => {
                let op = if high {
                    commands::LOAD_PAGE_HIGH
                } else {
                    commands::LOAD_PAGE_LOW
                };
                let [msb, lsb] = word.to_be_bytes();
                [op, msb, lsb, value]
            }
            Command::WritePage { word } => {
                let [msb, lsb] = word.to_be_bytes();
                [commands::WRITE_PAGE, msb, lsb, 0x00]
            }
            Command::ReadProgram { word, high } => {
                let op = if high {
                    commands::READ_PROGRAM_HIGH
                } else {
                    commands::READ_PROGRAM_LOW
                };
                let [msb, lsb] = word.to_be_bytes();
                [op, msb, lsb, 0x00]
            }
            Command::WriteFuse { category, value } => {
                let [a, b] = match category {
                    FuseCategory::Lock => commands::WRITE_LOCK,
                    FuseCategory::Low => commands::WRITE_FUSE_LOW,
                    FuseCategory::High => commands::WRITE_FUSE_HIGH,
                    FuseCategory::Extended => commands::WRITE_FUSE_EXTENDED,
                };
                [a, b, 0x00, value]
            }
            Command::ReadFuse { category } => {
                let [a, b] = match category {
                    FuseCategory::Lock => commands::READ_LOCK,
                    FuseCategory::Low => commands::READ_FUSE_LOW,
                    FuseCategory::High => commands::READ_FUSE_HIGH,
                    FuseCategory::Extended => commands::READ_FUSE_EXTENDED,
                };
                [a, b, 0x00, 0x00]
            }
        }
    }

    /// Byte expected in response byte 2 while the target is in sync: the
    /// target echoes command byte 1 there (`0x53` for programming enable).
    pub fn echo(&self) -> u8 {
        self.into_raw()[1]
    }
}

/// Response to a Command, as clocked back by the target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Response {
    echo: u8,
    raw: [u8; 4],
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK[{}]", hex::encode(self.raw))
        } else {
            write!(f, "NACK[{}]", hex::encode(self.raw))
        }
    }
}

impl Response {
    pub fn new(cmd: Command, raw: [u8; 4]) -> Self {
        Response {
            echo: cmd.echo(),
            raw,
        }
    }

    /// The target was in sync and acknowledged the instruction.
    pub fn is_ok(&self) -> bool {
        self.raw[2] == self.echo
    }

    /// The byte clocked out while the last command byte was shifted in.
    pub fn value(&self) -> u8 {
        self.raw[3]
    }

    pub fn raw(&self) -> [u8; 4] {
        self.raw
    }
}
