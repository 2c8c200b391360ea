//! Firmware payload formats
use std::{collections::BTreeMap, path::Path, str};

use ihex::Record;
use scroll::Pread;

use crate::{
    device::{PayloadFormat, PayloadRef},
    error::{Error, Result},
};

/// A firmware image in its encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    format: PayloadFormat,
    data: Vec<u8>,
}

impl Payload {
    pub fn new(format: PayloadFormat, data: Vec<u8>) -> Self {
        Payload { format, data }
    }

    pub fn from_hex_str(text: &str) -> Self {
        Self::new(PayloadFormat::Hex, text.as_bytes().to_vec())
    }

    /// Loads the image a catalog entry points to, relative to `base`.
    pub fn load(payload: &PayloadRef, base: &Path) -> Result<Self> {
        let path = payload.resolve(base);
        let data = std::fs::read(&path)?;
        let format = payload
            .format
            .unwrap_or_else(|| guess_format(&path, &data));
        log::info!("Read {} as {:?} format", path.display(), format);
        Ok(Self::new(format, data))
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let data = std::fs::read(p)?;
        let format = guess_format(p, &data);
        log::info!("Read {} as {:?} format", p.display(), format);
        Ok(Self::new(format, data))
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> PayloadFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "hex", "eep"].contains(&&*ext) {
        return PayloadFormat::Hex;
    }

    if raw.first() == Some(&b':')
        && raw.iter().all(|&c| {
            (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r'
        })
    {
        PayloadFormat::Hex
    } else {
        PayloadFormat::Compact
    }
}

/// Turns a payload into `(address, byte)` writes.
///
/// The decoder holds no state of its own: every call to [`ImageDecoder::iter`]
/// replays the payload from the start.
#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder<'a> {
    source: Source<'a>,
}

#[derive(Debug, Clone, Copy)]
enum Source<'a> {
    Hex(&'a str),
    Compact(&'a [u8]),
}

impl<'a> ImageDecoder<'a> {
    pub fn new(payload: &'a Payload) -> Result<Self> {
        let source = match payload.format {
            PayloadFormat::Hex => Source::Hex(
                str::from_utf8(&payload.data)
                    .map_err(|e| Error::malformed(format!("hex payload is not text: {}", e)))?,
            ),
            PayloadFormat::Compact => Source::Compact(&payload.data),
        };
        Ok(ImageDecoder { source })
    }

    pub fn iter(&self) -> Bytes<'a> {
        let records = match self.source {
            Source::Hex(text) => Records::Hex {
                lines: text.lines(),
                line: 0,
            },
            Source::Compact(raw) => Records::Compact { raw, pos: 0 },
        };
        Bytes {
            records,
            base: 0,
            pending: None,
            done: false,
        }
    }

    /// Replays the whole payload into a sparse memory image.
    pub fn to_image(&self) -> Result<MemoryImage> {
        let mut image = MemoryImage::default();
        for item in self.iter() {
            let (address, byte) = item?;
            image.insert(address, byte);
        }
        Ok(image)
    }
}

impl<'a> IntoIterator for &ImageDecoder<'a> {
    type Item = Result<(u32, u8)>;
    type IntoIter = Bytes<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

enum Records<'a> {
    Hex {
        lines: str::Lines<'a>,
        line: usize,
    },
    Compact {
        raw: &'a [u8],
        pos: usize,
    },
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Records::Hex { lines, line } => loop {
                let text = lines.next()?;
                *line += 1;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                return Some(Record::from_record_string(text).map_err(|e| {
                    Error::malformed(format!("line {}: {}", line, e))
                }));
            },
            Records::Compact { raw, pos } => {
                if *pos >= raw.len() {
                    return None;
                }
                let record = read_compact_record(&raw[*pos..]);
                match &record {
                    Ok((_, len)) => *pos += len,
                    Err(_) => *pos = raw.len(),
                }
                Some(record.map(|(record, _)| record))
            }
        }
    }
}

/// Parses one compact record, returning it and its encoded length.
fn read_compact_record(raw: &[u8]) -> Result<(Record, usize)> {
    // COUNT, ADDR(BE), TYPE, DATA, CHECKSUM
    let count = raw[0] as usize;
    let len = 1 + 2 + 1 + count + 1;
    if raw.len() < len {
        return Err(Error::malformed(format!(
            "truncated compact record: need {} bytes, have {}",
            len,
            raw.len()
        )));
    }
    let record = &raw[..len];
    let sum = record.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(Error::malformed(format!(
            "compact record checksum mismatch (sum 0x{:02x})",
            sum
        )));
    }

    let be = |offset: usize| -> Result<u16> {
        record
            .pread_with::<u16>(offset, scroll::BE)
            .map_err(|e| Error::malformed(e.to_string()))
    };
    let offset = be(1)?;
    let data = &record[4..4 + count];
    let expect_len = |n: usize| -> Result<()> {
        if count == n {
            Ok(())
        } else {
            Err(Error::malformed(format!(
                "record type 0x{:02x} with {} data bytes",
                record[3], count
            )))
        }
    };
    let parsed = match record[3] {
        0x00 => Record::Data {
            offset,
            value: data.to_vec(),
        },
        0x01 => Record::EndOfFile,
        0x02 => {
            expect_len(2)?;
            Record::ExtendedSegmentAddress(be(4)?)
        }
        0x03 => {
            expect_len(4)?;
            Record::StartSegmentAddress {
                cs: be(4)?,
                ip: be(6)?,
            }
        }
        0x04 => {
            expect_len(2)?;
            Record::ExtendedLinearAddress(be(4)?)
        }
        0x05 => {
            expect_len(4)?;
            Record::StartLinearAddress(
                record
                    .pread_with::<u32>(4, scroll::BE)
                    .map_err(|e| Error::malformed(e.to_string()))?,
            )
        }
        other => {
            return Err(Error::malformed(format!(
                "unknown record type 0x{:02x}",
                other
            )));
        }
    };
    Ok((parsed, len))
}

/// Lazy `(address, byte)` sequence over a payload.
pub struct Bytes<'a> {
    records: Records<'a>,
    base: u32,
    /// Address of the next data byte, `None` once it ran past `u32::MAX`.
    pending: Option<(Option<u32>, std::vec::IntoIter<u8>)>,
    done: bool,
}

impl Iterator for Bytes<'_> {
    type Item = Result<(u32, u8)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((address, data)) = &mut self.pending {
                if let Some(byte) = data.next() {
                    let Some(current) = *address else {
                        self.pending = None;
                        self.done = true;
                        return Some(Err(Error::malformed(
                            "data record runs past the 32-bit address space",
                        )));
                    };
                    *address = current.checked_add(1);
                    return Some(Ok((current, byte)));
                }
                self.pending = None;
            }
            if self.done {
                return None;
            }

            let record = match self.records.next() {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return Some(Err(Error::malformed("missing end-of-file record")));
                }
            };
            match record {
                Record::Data { offset, value } => {
                    self.pending = Some((Some(self.base + offset as u32), value.into_iter()));
                }
                Record::EndOfFile => self.done = true,
                Record::ExtendedSegmentAddress(address) => {
                    self.base = (address as u32) * 16;
                }
                Record::ExtendedLinearAddress(address) => {
                    self.base = (address as u32) << 16;
                }
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => (),
            }
        }
    }
}

/// Sparse program memory contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: BTreeMap<u32, u8>,
}

impl MemoryImage {
    pub fn insert(&mut self, address: u32, byte: u8) {
        self.bytes.insert(address, byte);
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.bytes.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// One past the highest written address.
    pub fn end_address(&self) -> u32 {
        self.bytes.keys().next_back().map_or(0, |a| a + 1)
    }

    /// Flattens the image from address 0, filling holes with `fill`.
    pub fn to_vec(&self, fill: u8) -> Vec<u8> {
        let mut binary = vec![fill; self.end_address() as usize];
        for (&address, &byte) in &self.bytes {
            binary[address as usize] = byte;
        }
        binary
    }
}
