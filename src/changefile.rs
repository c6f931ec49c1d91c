//! The copy-on-write change file.
//!
//! A change file sits next to a (usually read-only) source image and
//! captures every written block. Layout, all little-endian:
//!
//! ```text
//! 0x00  header        32 bytes, magics 0xDEADBEEF / 0xFEEDF00D
//! 0x20  block map     u64 per block: file offset of the record, 0 = absent
//! ....  records       blocksize payload + 16-byte trailer, appended
//! ```
//!
//! The map lives in memory while the file is open and only hits the disk
//! on [`ChangeFile::sync`]; the header's dirty bit marks the window where
//! the on-disk map lags behind. Records themselves are never relocated or
//! reclaimed.

use std::io::{Cursor, SeekFrom};
use std::path::Path;

use binrw::{BinRead, BinWrite, binrw};
use log::warn;

use crate::ImageError;
use crate::checksum::crc32;
use crate::sysio::{SysFile, SysOpenMode};

pub const CF_MAGIC_1: u32 = 0xDEAD_BEEF;
pub const CF_MAGIC_2: u32 = 0xFEED_F00D;
pub const CF_TRAILER_MAGIC: u32 = 0x3A07_0045;
pub const CF_VERSION: u16 = 1;

const CF_FLAG_DIRTY: u16 = 1 << 0;

/// The change file an image gets when none was named: `<image>.cf`.
pub fn default_cf_path(image: &Path) -> std::path::PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".cf");
    name.into()
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default)]
pub struct ChangeFileHeader {
    magic: u32,           /* 0x00 */
    version: u16,         /* 0x04 */
    flags: u16,           /* 0x06 - bit 0: dirty */
    total_blocks: u64,    /* 0x08 */
    used_blocks: u64,     /* 0x10 */
    blockmap_offset: u32, /* 0x18 */
    magic2: u32,          /* 0x1c */
}

impl ChangeFileHeader {
    pub const SIZE: u64 = 32;

    fn new(total_blocks: u64) -> Self {
        ChangeFileHeader {
            magic: CF_MAGIC_1,
            version: CF_VERSION,
            flags: 0,
            total_blocks,
            used_blocks: 0,
            blockmap_offset: Self::SIZE as u32,
            magic2: CF_MAGIC_2,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & CF_FLAG_DIRTY != 0
    }

    fn as_bytes(&self) -> [u8; Self::SIZE as usize] {
        let mut cursor = Cursor::new([0u8; Self::SIZE as usize]);
        self.write_le(&mut cursor).expect("fixed-size header");
        cursor.into_inner()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct BlockTrailer {
    curblock: u64,
    crc: u32,
    magic: u32,
}

impl BlockTrailer {
    const SIZE: u64 = 16;
}

pub struct ChangeFile {
    file: SysFile,
    header: ChangeFileHeader,
    blockmap: Vec<u64>,
    blocksize: u64,
    blockcount: u64,
    cursor: u64,
    verified: bool,
}

impl ChangeFile {
    /// Open an existing change file. The file is not trusted until
    /// [`ChangeFile::verify`] has loaded and checked the header.
    pub fn open(path: &Path, blocksize: u64, blockcount: u64) -> Result<ChangeFile, ImageError> {
        let file = SysFile::open(path, SysOpenMode::ReadWrite)?;
        Ok(ChangeFile {
            file,
            header: ChangeFileHeader::default(),
            blockmap: Vec::new(),
            blocksize,
            blockcount,
            cursor: 0,
            verified: false,
        })
    }

    /// Open the change file at `path`, laying down a fresh header and an
    /// all-zero block map first if it does not exist yet. The returned
    /// handle is verified and ready for I/O.
    pub fn create(path: &Path, blocksize: u64, blockcount: u64) -> Result<ChangeFile, ImageError> {
        if SysFile::open(path, SysOpenMode::ReadOnly).is_err() {
            let mut file = SysFile::open(path, SysOpenMode::Create)?;
            let header = ChangeFileHeader::new(blockcount);
            file.write_exact(&header.as_bytes())?;
            file.write_exact(&vec![0u8; (blockcount * 8) as usize])?;
        }
        let mut cf = ChangeFile::open(path, blocksize, blockcount)?;
        cf.verify()?;
        Ok(cf)
    }

    /// Load the header and block map. `total_blocks` may exceed the
    /// image's block count by one: images with a virtual trailing block
    /// record it in the change file.
    pub fn verify(&mut self) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = [0u8; ChangeFileHeader::SIZE as usize];
        self.file.read_exact(&mut raw)?;
        let header = ChangeFileHeader::read_le(&mut Cursor::new(&raw))?;

        if header.magic != CF_MAGIC_1
            || header.magic2 != CF_MAGIC_2
            || header.version != CF_VERSION
        {
            return Err(ImageError::Unsupported);
        }
        if header.total_blocks != self.blockcount && header.total_blocks != self.blockcount + 1 {
            return Err(ImageError::Unsupported);
        }
        if header.is_dirty() {
            warn!("change file was not synced cleanly; block map may be stale");
        }

        let mut raw_map = vec![0u8; (header.total_blocks * 8) as usize];
        self.file.seek(SeekFrom::Start(header.blockmap_offset as u64))?;
        self.file.read_exact(&mut raw_map)?;
        self.blockmap = raw_map
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        self.header = header;
        self.verified = true;
        Ok(())
    }

    /// Move the block cursor. Only updates in-memory state.
    pub fn seek(&mut self, block: u64) -> Result<(), ImageError> {
        if block > self.header.total_blocks {
            return Err(ImageError::OutOfRange);
        }
        self.cursor = block;
        Ok(())
    }

    pub fn block_used(&self) -> bool {
        self.blockmap
            .get(self.cursor as usize)
            .is_some_and(|&offset| offset != 0)
    }

    /// Read the block at the cursor into `buf` (exactly one blocksize).
    /// Fails with [`ImageError::NotPresent`] if the block was never
    /// written, [`ImageError::BadRecord`] if the stored record does not
    /// check out.
    pub fn read_block(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        debug_assert_eq!(buf.len() as u64, self.blocksize);
        let offset = *self
            .blockmap
            .get(self.cursor as usize)
            .ok_or(ImageError::OutOfRange)?;
        if offset == 0 {
            return Err(ImageError::NotPresent);
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        let mut raw = [0u8; BlockTrailer::SIZE as usize];
        self.file.read_exact(&mut raw)?;
        let trailer = BlockTrailer::read_le(&mut Cursor::new(&raw))?;

        if trailer.curblock != self.cursor
            || trailer.magic != CF_TRAILER_MAGIC
            || trailer.crc != crc32(0, buf)
        {
            return Err(ImageError::BadRecord);
        }
        Ok(())
    }

    /// Write one block at the cursor. Overwrites the existing record in
    /// place if the block was written before, otherwise appends a new
    /// record and updates the in-memory map.
    pub fn write_block(&mut self, buf: &[u8]) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        debug_assert_eq!(buf.len() as u64, self.blocksize);
        let existing = *self
            .blockmap
            .get(self.cursor as usize)
            .ok_or(ImageError::OutOfRange)?;
        let position = if existing != 0 {
            self.file.seek(SeekFrom::Start(existing))?
        } else {
            self.file.seek(SeekFrom::End(0))?
        };

        let trailer = BlockTrailer {
            curblock: self.cursor,
            crc: crc32(0, buf),
            magic: CF_TRAILER_MAGIC,
        };
        let mut raw = Cursor::new([0u8; BlockTrailer::SIZE as usize]);
        trailer.write_le(&mut raw)?;

        // Payload first, then trailer: a crash in between leaves a
        // record the trailer check will reject.
        self.file.write_exact(buf)?;
        self.file.write_exact(&raw.into_inner())?;

        if existing == 0 {
            self.blockmap[self.cursor as usize] = position;
            self.header.used_blocks += 1;
            self.header.flags |= CF_FLAG_DIRTY;
        }
        Ok(())
    }

    /// Flush the header (dirty bit cleared) and the block map. No-op if
    /// nothing changed since the last sync.
    pub fn sync(&mut self) -> Result<(), ImageError> {
        if !self.header.is_dirty() {
            return Ok(());
        }
        let mut clean = self.header.clone();
        clean.flags &= !CF_FLAG_DIRTY;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_exact(&clean.as_bytes())?;
        self.file
            .seek(SeekFrom::Start(self.header.blockmap_offset as u64))?;
        let mut raw_map = Vec::with_capacity(self.blockmap.len() * 8);
        for &offset in &self.blockmap {
            raw_map.extend_from_slice(&offset.to_le_bytes());
        }
        self.file.write_exact(&raw_map)?;

        self.header.flags &= !CF_FLAG_DIRTY;
        Ok(())
    }

    /// Sync if needed and consume the handle.
    pub fn finish(mut self) -> Result<(), ImageError> {
        self.sync()
    }

    pub fn header(&self) -> &ChangeFileHeader {
        &self.header
    }

    pub fn blocksize(&self) -> u64 {
        self.blocksize
    }

    /// File offset of the stored record for `block`, 0 if absent.
    pub fn record_offset(&self, block: u64) -> u64 {
        self.blockmap.get(block as usize).copied().unwrap_or(0)
    }

    /// Re-read and fully check the record for `block` without moving the
    /// cursor. Used by the change-file inspector.
    pub fn verify_record(&mut self, block: u64, buf: &mut [u8]) -> Result<(), ImageError> {
        let saved = self.cursor;
        self.seek(block)?;
        let result = self.read_block(buf);
        self.cursor = saved;
        result
    }
}

impl Drop for ChangeFile {
    fn drop(&mut self) {
        if self.verified && self.header.is_dirty() {
            let _ = self.sync();
        }
    }
}
