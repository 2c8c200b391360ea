//! Buffering of decoded bytes into flash pages.
use crate::error::{Error, Result};

/// One flash page, addressed in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Page {
    /// Word address of the first word in the page.
    pub fn word_address(&self) -> u32 {
        self.address / 2
    }
}

/// Receives pages as they fill. Retry policy belongs to the implementor.
pub trait PageCommit {
    fn commit(&mut self, page: &Page) -> Result<()>;
}

impl<F: FnMut(&Page) -> Result<()>> PageCommit for F {
    fn commit(&mut self, page: &Page) -> Result<()> {
        self(page)
    }
}

/// Collects `(address, byte)` writes into page-sized windows.
///
/// A page is handed to the committer once all its bytes were written, or when
/// the next address falls outside it. Bytes never written keep the pad value.
/// Pages must arrive in ascending order; a page base is committed once.
pub struct FlashPageWriter {
    page_bytes: u32,
    pad: u8,
    current: Option<Buffer>,
    /// Lowest page base still open for writing.
    next_base: u32,
    pages: usize,
}

struct Buffer {
    page: Page,
    touched: Vec<bool>,
    remaining: usize,
}

impl FlashPageWriter {
    pub fn new(page_bytes: u32, pad: u8) -> Result<Self> {
        if page_bytes == 0 {
            return Err(Error::Catalog("page size must not be zero".into()));
        }
        Ok(FlashPageWriter {
            page_bytes,
            pad,
            current: None,
            next_base: 0,
            pages: 0,
        })
    }

    pub fn page_bytes(&self) -> u32 {
        self.page_bytes
    }

    /// Pages committed so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn push<C: PageCommit + ?Sized>(&mut self, address: u32, byte: u8, sink: &mut C) -> Result<()> {
        let base = address - address % self.page_bytes;
        if self.current.as_ref().is_some_and(|b| b.page.address != base) {
            self.flush(sink)?;
        }

        let page_bytes = self.page_bytes as usize;
        if self.current.is_none() {
            if base < self.next_base {
                return Err(Error::malformed(format!(
                    "address 0x{:04x} falls in an already written page",
                    address
                )));
            }
            self.current = Some(Buffer {
                page: Page {
                    address: base,
                    data: vec![self.pad; page_bytes],
                },
                touched: vec![false; page_bytes],
                remaining: page_bytes,
            });
        }

        let full = match self.current.as_mut() {
            Some(buffer) => {
                let offset = (address - base) as usize;
                buffer.page.data[offset] = byte;
                if !buffer.touched[offset] {
                    buffer.touched[offset] = true;
                    buffer.remaining -= 1;
                }
                buffer.remaining == 0
            }
            None => false,
        };
        if full {
            self.flush(sink)?;
        }
        Ok(())
    }

    /// Pads and commits the page still being filled, if any.
    pub fn finish<C: PageCommit + ?Sized>(&mut self, sink: &mut C) -> Result<()> {
        self.flush(sink)
    }

    fn flush<C: PageCommit + ?Sized>(&mut self, sink: &mut C) -> Result<()> {
        if let Some(buffer) = self.current.take() {
            self.next_base = buffer.page.address + self.page_bytes;
            sink.commit(&buffer.page)?;
            self.pages += 1;
        }
        Ok(())
    }
}
