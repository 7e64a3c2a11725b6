//! Index-separated byte buffer underlying wire framing
//!
//! A [`ChannelBuffer`] keeps independent reader and writer indices over one
//! backing allocation, so partially decoded frames can be rewound with
//! mark/reset and consumed prefixes reclaimed with
//! [`ChannelBuffer::discard_read_bytes`]. The invariant
//! `0 <= reader_index <= writer_index <= capacity` holds after every
//! operation.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("index out of bounds: {0}")]
    OutOfBounds(String),
}

pub type BufferResult<T> = Result<T, BufferError>;

const MIN_GROWTH: usize = 64;

/// Byte buffer with separate reader and writer indices
#[derive(Debug)]
pub struct ChannelBuffer {
    data: BytesMut,
    reader_index: usize,
    writer_index: usize,
    marked_reader: usize,
    marked_writer: usize,
    dynamic: bool,
}

impl ChannelBuffer {
    /// Create a growable buffer with the given initial capacity
    pub fn dynamic(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity.max(MIN_GROWTH));
        data.resize(capacity.max(MIN_GROWTH), 0);
        Self {
            data,
            reader_index: 0,
            writer_index: 0,
            marked_reader: 0,
            marked_writer: 0,
            dynamic: true,
        }
    }

    /// Create a fixed-capacity buffer; writes past the end fail
    pub fn fixed(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Self {
            data,
            reader_index: 0,
            writer_index: 0,
            marked_reader: 0,
            marked_writer: 0,
            dynamic: false,
        }
    }

    /// Wrap existing bytes as a readable fixed buffer
    pub fn wrapped(bytes: &[u8]) -> Self {
        let mut buf = Self::fixed(bytes.len());
        buf.data[..bytes.len()].copy_from_slice(bytes);
        buf.writer_index = bytes.len();
        buf
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn set_reader_index(&mut self, index: usize) -> BufferResult<()> {
        if index > self.writer_index {
            return Err(BufferError::OutOfBounds(format!(
                "reader index {} > writer index {}",
                index, self.writer_index
            )));
        }
        self.reader_index = index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, index: usize) -> BufferResult<()> {
        if index < self.reader_index || index > self.capacity() {
            return Err(BufferError::OutOfBounds(format!(
                "writer index {} outside [{}, {}]",
                index,
                self.reader_index,
                self.capacity()
            )));
        }
        self.writer_index = index;
        Ok(())
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index
    }

    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// The readable region as a slice, without consuming it
    pub fn readable(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    pub fn mark_reader_index(&mut self) {
        self.marked_reader = self.reader_index;
    }

    pub fn reset_reader_index(&mut self) {
        self.reader_index = self.marked_reader;
    }

    pub fn mark_writer_index(&mut self) {
        self.marked_writer = self.writer_index;
    }

    pub fn reset_writer_index(&mut self) -> BufferResult<()> {
        if self.marked_writer < self.reader_index {
            return Err(BufferError::OutOfBounds(format!(
                "marked writer index {} < reader index {}",
                self.marked_writer, self.reader_index
            )));
        }
        self.writer_index = self.marked_writer;
        Ok(())
    }

    /// Zero both indices; content is untouched
    pub fn clear(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
    }

    fn check_readable(&self, len: usize) -> BufferResult<()> {
        if self.readable_bytes() < len {
            return Err(BufferError::OutOfBounds(format!(
                "read of {} bytes exceeds readable {}",
                len,
                self.readable_bytes()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> BufferResult<u8> {
        self.check_readable(1)?;
        let b = self.data[self.reader_index];
        self.reader_index += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> BufferResult<u16> {
        let mut b = [0u8; 2];
        self.read_slice(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn read_u32(&mut self) -> BufferResult<u32> {
        let mut b = [0u8; 4];
        self.read_slice(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    pub fn read_u64(&mut self) -> BufferResult<u64> {
        let mut b = [0u8; 8];
        self.read_slice(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    pub fn read_slice(&mut self, dst: &mut [u8]) -> BufferResult<()> {
        self.check_readable(dst.len())?;
        dst.copy_from_slice(&self.data[self.reader_index..self.reader_index + dst.len()]);
        self.reader_index += dst.len();
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> BufferResult<Bytes> {
        self.check_readable(len)?;
        let out = Bytes::copy_from_slice(&self.data[self.reader_index..self.reader_index + len]);
        self.reader_index += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> BufferResult<()> {
        self.check_readable(len)?;
        self.reader_index += len;
        Ok(())
    }

    /// Make room for at least `len` more bytes, growing geometrically when
    /// the buffer is dynamic
    pub fn ensure_writable(&mut self, len: usize) -> BufferResult<()> {
        if self.writable_bytes() >= len {
            return Ok(());
        }
        if !self.dynamic {
            return Err(BufferError::OutOfBounds(format!(
                "write of {} bytes exceeds writable {}",
                len,
                self.writable_bytes()
            )));
        }
        let needed = self.writer_index + len;
        let mut new_capacity = self.capacity().max(MIN_GROWTH);
        while new_capacity < needed {
            new_capacity *= 2;
        }
        self.data.resize(new_capacity, 0);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> BufferResult<()> {
        self.ensure_writable(1)?;
        self.data[self.writer_index] = value;
        self.writer_index += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> BufferResult<()> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> BufferResult<()> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> BufferResult<()> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_slice(&mut self, src: &[u8]) -> BufferResult<()> {
        self.ensure_writable(src.len())?;
        self.data[self.writer_index..self.writer_index + src.len()].copy_from_slice(src);
        self.writer_index += src.len();
        Ok(())
    }

    /// Compact the buffer: move `[reader_index, writer_index)` to the front
    /// and pull both indices (and their marks) back accordingly
    pub fn discard_read_bytes(&mut self) {
        if self.reader_index == 0 {
            return;
        }
        let len = self.readable_bytes();
        self.data.copy_within(self.reader_index..self.writer_index, 0);
        self.marked_reader = self.marked_reader.saturating_sub(self.reader_index);
        self.marked_writer = self.marked_writer.saturating_sub(self.reader_index);
        self.reader_index = 0;
        self.writer_index = len;
    }
}
