//! Thin wrapper over the platform file primitives.
//!
//! Everything above this module works in whole buffers: a read or write
//! that moves fewer bytes than requested is an error, not a partial
//! success the caller has to loop over.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysOpenMode {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    /// Create a new file, read/write. Fails if the file already exists.
    Create,
}

pub struct SysFile {
    file: File,
}

impl SysFile {
    pub fn open(path: &Path, mode: SysOpenMode) -> Result<SysFile, ImageError> {
        let mut options = OpenOptions::new();
        match mode {
            SysOpenMode::ReadOnly => options.read(true),
            SysOpenMode::ReadWrite => options.read(true).write(true),
            SysOpenMode::WriteOnly => options.write(true),
            SysOpenMode::Create => options.read(true).write(true).create_new(true),
        };
        Ok(SysFile {
            file: options.open(path)?,
        })
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, ImageError> {
        Ok(self.file.seek(pos)?)
    }

    pub fn position(&mut self) -> Result<u64, ImageError> {
        Ok(self.file.stream_position()?)
    }

    /// Read exactly `buf.len()` bytes. A short read surfaces as an I/O
    /// error (`UnexpectedEof`).
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        Ok(self.file.read_exact(buf)?)
    }

    /// Read up to `buf.len()` bytes, stopping early only at end of file.
    /// Returns the number of bytes read.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImageError::Io(e)),
            }
        }
        Ok(total)
    }

    /// Write exactly `buf.len()` bytes. A short write surfaces as an I/O
    /// error (`WriteZero`).
    pub fn write_exact(&mut self, buf: &[u8]) -> Result<(), ImageError> {
        Ok(self.file.write_all(buf)?)
    }

    /// Size of the file in bytes. Specials and pipes stat as zero, in
    /// which case we fall back to seeking to the end and back.
    pub fn size(&mut self) -> Result<u64, ImageError> {
        let len = self.file.metadata()?.len();
        if len > 0 {
            return Ok(len);
        }
        let saved = self.file.stream_position()?;
        let end = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(saved))?;
        Ok(end)
    }
}
