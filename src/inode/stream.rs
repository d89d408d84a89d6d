//! Streams over inode values.
//!
//! Output streams buffer one block of data and append it to the inode a page
//! at a time; whatever is buffered is appended on `flush`, `close` or drop.

use std::fmt;
use std::io::{self, Read, Write};

use bytes::BytesMut;
use tracing::warn;

use crate::block::BLOCK_SIZE;
use crate::error::{Result, StoreError};
use crate::transaction::Transaction;

use super::Inode;

/// Code units buffered by a `ClobWriter` before appending
const CLOB_PAGE_CHARS: usize = BLOCK_SIZE / 2;

impl Inode {
    /// Byte stream over a snapshot of the value
    pub fn open_input_stream(&self) -> BlobInputStream {
        BlobInputStream {
            inode: self.clone(),
            position: 0,
        }
    }

    /// Byte sink appending to the value
    pub fn open_output_stream<'a>(&'a mut self, xa: &'a mut Transaction) -> BlobOutputStream<'a> {
        BlobOutputStream {
            inode: self,
            xa,
            buffer: BytesMut::with_capacity(BLOCK_SIZE),
            closed: false,
        }
    }

    /// Character reader over a snapshot of the value
    pub fn open_reader(&self) -> ClobReader {
        ClobReader {
            inode: self.clone(),
            position: 0,
        }
    }

    /// Character sink appending UTF-16 to the value
    pub fn open_writer<'a>(&'a mut self, xa: &'a mut Transaction) -> ClobWriter<'a> {
        ClobWriter {
            inode: self,
            xa,
            buffer: Vec::with_capacity(CLOB_PAGE_CHARS),
            error: None,
            closed: false,
        }
    }
}

// =============================================================================
// Blob Streams
// =============================================================================

pub struct BlobInputStream {
    inode: Inode,
    position: u64,
}

impl BlobInputStream {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.inode.length().saturating_sub(self.position)
    }
}

impl Read for BlobInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inode.read(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl fmt::Debug for BlobInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobInputStream")
            .field("length", &self.inode.length())
            .field("position", &self.position)
            .finish()
    }
}

pub struct BlobOutputStream<'a> {
    inode: &'a mut Inode,
    xa: &'a mut Transaction,
    buffer: BytesMut,
    closed: bool,
}

impl BlobOutputStream<'_> {
    /// Bytes accepted but not yet appended
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append the buffered bytes and end the stream
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.flush_page()
    }

    fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = (BLOCK_SIZE - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..n]);
            data = &data[n..];

            if self.buffer.len() == BLOCK_SIZE {
                self.flush_page()?;
            }
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.inode.append(self.xa, &self.buffer);
        self.buffer.clear();
        result
    }
}

impl Write for BlobOutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_page()?;
        Ok(())
    }
}

impl Drop for BlobOutputStream<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.flush_page() {
                warn!(error = %e, "failed to flush blob stream on drop");
            }
        }
    }
}

// =============================================================================
// Clob Streams
// =============================================================================

pub struct ClobReader {
    inode: Inode,
    /// In UTF-16 code units
    position: u64,
}

impl ClobReader {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read UTF-16 code units, returning how many were copied
    pub fn read_chars(&mut self, buf: &mut [u16]) -> Result<usize> {
        let n = self.inode.read_chars(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Decode everything from the current position
    pub fn read_to_string(&mut self) -> Result<String> {
        let remaining = self.inode.char_length().saturating_sub(self.position);
        let mut chars = vec![0u16; remaining as usize];
        let n = self.read_chars(&mut chars)?;
        String::from_utf16(&chars[..n])
            .map_err(|e| StoreError::Serialization(format!("clob is not valid UTF-16: {}", e)))
    }
}

pub struct ClobWriter<'a> {
    inode: &'a mut Inode,
    xa: &'a mut Transaction,
    buffer: Vec<u16>,
    /// First failure seen through `fmt::Write`, reported by `close`
    error: Option<StoreError>,
    closed: bool,
}

impl ClobWriter<'_> {
    pub fn write_chars(&mut self, mut chars: &[u16]) -> Result<()> {
        while !chars.is_empty() {
            let n = (CLOB_PAGE_CHARS - self.buffer.len()).min(chars.len());
            self.buffer.extend_from_slice(&chars[..n]);
            chars = &chars[n..];

            if self.buffer.len() == CLOB_PAGE_CHARS {
                self.flush_page()?;
            }
        }
        Ok(())
    }

    /// Append the buffered text and end the writer
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.flush_page()
    }

    fn flush_page(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.inode.append_chars(self.xa, &self.buffer);
        self.buffer.clear();
        result
    }
}

impl fmt::Write for ClobWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.error.is_some() {
            return Err(fmt::Error);
        }
        let chars: Vec<u16> = s.encode_utf16().collect();
        self.write_chars(&chars).map_err(|e| {
            self.error = Some(e);
            fmt::Error
        })
    }
}

impl Drop for ClobWriter<'_> {
    fn drop(&mut self) {
        if !self.closed && self.error.is_none() {
            if let Err(e) = self.flush_page() {
                warn!(error = %e, "failed to flush clob writer on drop");
            }
        }
    }
}
