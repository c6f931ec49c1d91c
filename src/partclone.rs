//! The partclone image backend (format versions 0001 and 0002).
//!
//! Both versions are a header, a usage bitmap, then the used blocks
//! stored densely in bitmap order with interleaved checksums. Version
//! 0001 stores the bitmap as one byte per block followed by a
//! `"BiTmAgIc"` sentinel, and checksums every record with an
//! *incremental* legacy CRC (see [`crate::checksum`]). Version 0002
//! bit-packs the bitmap and parameterises the checksum stride through
//! the header.
//!
//! Seeking block N means knowing how many used blocks precede N, since
//! only those occupy records. `verify` precomputes that count at every
//! 1024-block boundary so a seek scans at most one bucket of the bitmap.

use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};

use binrw::{BinRead, binrw};
use log::{debug, warn};

use crate::bitmap::Bitmap;
use crate::changefile::{ChangeFile, default_cf_path};
use crate::checksum::{CRC_CHAIN_SEED, crc32_repeat_first};
use crate::sysio::{SysFile, SysOpenMode};
use crate::{ImageError, OpenMode};

pub const PARTCLONE_MAGIC: &[u8; 15] = b"partclone-image";
const BITMAP_MAGIC: &[u8; 8] = b"BiTmAgIc";
/// Little-endian marker in the v2 header.
const ENDIAN_MAGIC: u16 = 0xC0DE;
/// v2 bitmap mode for one bit per block.
const BITMAP_MODE_BIT: u8 = 1;
/// Buckets cover `1 << BUCKET_FACTOR` blocks each.
const BUCKET_FACTOR: u32 = 10;
const CRC_SIZE: u64 = 4;
/// Offset of the 4-byte version string, shared by both header layouts.
const VERSION_OFFSET: usize = 30;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct PartcloneHeaderV1 {
    magic: [u8; 15],
    fs: [u8; 15],
    version: [u8; 4],
    #[brw(pad_before = 2)] /* struct alignment padding in the format */
    block_size: i32,
    device_size: u64,
    totalblock: u64,
    #[brw(pad_after = 4096)] /* scratch buffer, contents ignored */
    usedblocks: u64,
}

impl PartcloneHeaderV1 {
    pub const SIZE: u64 = 4160;
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct PartcloneHeaderV2 {
    magic: [u8; 16],
    ptc_version: [u8; 14],
    version: [u8; 4],
    endianess: u16,
    fs: [u8; 16],
    device_size: u64,
    totalblock: u64,
    usedblocks: u64,
    used_bitmap: u64,
    block_size: u32,
    feature_size: u32,
    image_version: u16,
    cpu_bits: u16,
    checksum_mode: u16,
    checksum_size: u16,
    blocks_per_checksum: u32,
    reseed_checksum: u8,
    bitmap_mode: u8,
    crc: u32,
}

impl PartcloneHeaderV2 {
    pub const SIZE: u64 = 110;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    V1,
    V2,
}

pub struct PartcloneImage {
    file: SysFile,
    path: PathBuf,
    cf_path: Option<PathBuf>,
    change_file: Option<ChangeFile>,
    mode: OpenMode,
    version: Option<Version>,
    fs_tag: String,
    block_size: u64,
    device_size: u64,
    totalblock: u64,
    usedblocks: u64,
    /// Offset of the first block record in the file.
    head_size: u64,
    checksum_size: u64,
    blocks_per_checksum: u64,
    /// One byte per block, normalised to 0/1.
    bitmap: Vec<u8>,
    /// Count of used blocks preceding every 1024-block boundary.
    sumcount: Vec<u64>,
    /// Used blocks preceding the cursor, maintained by seek/read.
    preceding_used: u64,
    cursor: u64,
    verified: bool,
}

fn tag_to_string(tag: &[u8]) -> String {
    let end = tag.iter().position(|&b| b == 0).unwrap_or(tag.len());
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

impl PartcloneImage {
    /// Header-only check: is this a partclone image of a version we can
    /// handle?
    pub fn probe(path: &Path) -> Result<(), ImageError> {
        let mut file = SysFile::open(path, SysOpenMode::ReadOnly)?;
        let mut prefix = [0u8; VERSION_OFFSET + 4];
        file.read_exact(&mut prefix)?;
        if &prefix[..15] != PARTCLONE_MAGIC {
            return Err(ImageError::Unsupported);
        }
        match &prefix[VERSION_OFFSET..] {
            b"0001" | b"0002" => Ok(()),
            _ => Err(ImageError::Unsupported),
        }
    }

    pub fn open(
        path: &Path,
        cf_path: Option<&Path>,
        mode: OpenMode,
    ) -> Result<PartcloneImage, ImageError> {
        let file = SysFile::open(path, SysOpenMode::ReadOnly)?;
        Ok(PartcloneImage {
            file,
            path: path.to_path_buf(),
            cf_path: cf_path.map(Path::to_path_buf),
            change_file: None,
            mode,
            version: None,
            fs_tag: String::new(),
            block_size: 0,
            device_size: 0,
            totalblock: 0,
            usedblocks: 0,
            head_size: 0,
            checksum_size: 0,
            blocks_per_checksum: 0,
            bitmap: Vec::new(),
            sumcount: Vec::new(),
            preceding_used: 0,
            cursor: 0,
            verified: false,
        })
    }

    /// Partclone images have no recoverable parse ambiguity; the flag is
    /// accepted for interface parity and otherwise unused.
    pub fn set_tolerant(&mut self) {}

    pub fn verify(&mut self) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut prefix = [0u8; VERSION_OFFSET + 4];
        self.file.read_exact(&mut prefix)?;
        if &prefix[..15] != PARTCLONE_MAGIC {
            return Err(ImageError::Unsupported);
        }
        match &prefix[VERSION_OFFSET..] {
            b"0001" => self.verify_v1()?,
            b"0002" => self.verify_v2()?,
            _ => return Err(ImageError::Unsupported),
        }

        if let Some(cf_path) = &self.cf_path
            && self.mode == OpenMode::ReadWrite
            && let Ok(mut cf) = ChangeFile::open(cf_path, self.block_size, self.totalblock)
        {
            cf.verify()?;
            self.change_file = Some(cf);
        }

        self.preceding_used = 0;
        self.cursor = 0;
        self.verified = true;
        Ok(())
    }

    fn verify_v1(&mut self) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; PartcloneHeaderV1::SIZE as usize];
        self.file.read_exact(&mut raw)?;
        let header = PartcloneHeaderV1::read_le(&mut Cursor::new(&raw))?;
        if header.block_size <= 0 {
            return Err(ImageError::Unsupported);
        }

        let mut bitmap = vec![0u8; header.totalblock as usize];
        self.file.read_exact(&mut bitmap)?;
        let mut sentinel = [0u8; 8];
        self.file.read_exact(&mut sentinel)?;
        if &sentinel != BITMAP_MAGIC {
            return Err(ImageError::BadRecord);
        }

        // The bitmap can carry bytes other than 0 or 1; anything not
        // exactly 1 means the block is not in the file.
        let oddballs = bitmap.iter().filter(|&&b| b > 1).count();
        if oddballs > 0 {
            warn!("bitmap has {oddballs} entries that are neither 0 nor 1; treating as free");
        }
        for byte in &mut bitmap {
            *byte = (*byte == 1) as u8;
        }

        self.fs_tag = tag_to_string(&header.fs);
        self.version = Some(Version::V1);
        self.block_size = header.block_size as u64;
        self.totalblock = header.totalblock;
        self.head_size = PartcloneHeaderV1::SIZE + header.totalblock + BITMAP_MAGIC.len() as u64;
        self.checksum_size = CRC_SIZE;
        self.blocks_per_checksum = 1;
        self.build_sumcount(bitmap);

        self.device_size = header.device_size;
        let expected = self.totalblock * self.block_size;
        if self.device_size != expected {
            debug!(
                "device size {} disagrees with {} blocks of {}; fixing up",
                self.device_size, self.totalblock, self.block_size
            );
            self.device_size = expected;
        }
        // Some filesystems write a derived used-block count; the bitmap
        // is authoritative.
        let nset = self.bitmap.iter().map(|&b| b as u64).sum::<u64>();
        if header.usedblocks != nset {
            debug!(
                "header says {} used blocks, bitmap says {nset}; fixing up",
                header.usedblocks
            );
        }
        self.usedblocks = nset;
        Ok(())
    }

    fn verify_v2(&mut self) -> Result<(), ImageError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; PartcloneHeaderV2::SIZE as usize];
        self.file.read_exact(&mut raw)?;
        let header = PartcloneHeaderV2::read_le(&mut Cursor::new(&raw))?;
        if header.block_size == 0 {
            return Err(ImageError::Unsupported);
        }
        if header.endianess != ENDIAN_MAGIC {
            warn!("endianness marker {:#06x} is not little-endian", header.endianess);
        }
        if header.bitmap_mode != BITMAP_MODE_BIT {
            return Err(ImageError::Unsupported);
        }

        let bitmap_bytes = header.totalblock.div_ceil(8);
        let mut packed = vec![0u8; bitmap_bytes as usize];
        self.file.read_exact(&mut packed)?;
        let packed = Bitmap::from_bytes(packed, header.totalblock);
        let bitmap: Vec<u8> = (0..header.totalblock)
            .map(|i| packed.get(i) as u8)
            .collect();
        // Skip the bitmap's own checksum.
        self.file
            .seek(SeekFrom::Current(header.checksum_size as i64))?;

        self.fs_tag = tag_to_string(&header.fs);
        self.version = Some(Version::V2);
        self.block_size = header.block_size as u64;
        self.device_size = header.device_size;
        self.totalblock = header.totalblock;
        self.usedblocks = header.usedblocks;
        self.head_size = PartcloneHeaderV2::SIZE + bitmap_bytes + header.checksum_size as u64;
        self.checksum_size = header.checksum_size as u64;
        self.blocks_per_checksum = header.blocks_per_checksum as u64;
        self.build_sumcount(bitmap);
        Ok(())
    }

    fn build_sumcount(&mut self, bitmap: Vec<u8>) {
        let mut sumcount = vec![0u64; ((bitmap.len() as u64 >> BUCKET_FACTOR) + 1) as usize];
        let mut nset = 0u64;
        for (i, &used) in bitmap.iter().enumerate() {
            if i as u64 & ((1 << BUCKET_FACTOR) - 1) == 0 {
                sumcount[i >> BUCKET_FACTOR] = nset;
            }
            nset += used as u64;
        }
        self.bitmap = bitmap;
        self.sumcount = sumcount;
    }

    pub fn fs_tag(&self) -> &str {
        &self.fs_tag
    }

    pub fn version_str(&self) -> &'static str {
        match self.version {
            Some(Version::V1) => "0001",
            Some(Version::V2) => "0002",
            None => "?",
        }
    }

    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn usedblocks(&self) -> u64 {
        self.usedblocks
    }

    pub fn blocksize(&self) -> Result<u64, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        Ok(self.block_size)
    }

    pub fn blockcount(&self) -> Result<u64, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        Ok(self.totalblock)
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn seek(&mut self, block: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        if block > self.totalblock {
            return Err(ImageError::OutOfRange);
        }
        let mut preceding = self.sumcount[(block >> BUCKET_FACTOR) as usize];
        let start = block & !((1u64 << BUCKET_FACTOR) - 1);
        for b in start..block {
            preceding += self.bitmap[b as usize] as u64;
        }
        self.preceding_used = preceding;
        self.cursor = block;

        if let Some(cf) = &mut self.change_file {
            cf.seek(block)?;
        }
        Ok(())
    }

    /// File offset of used-block record `index`.
    fn record_offset(&self, index: u64) -> u64 {
        let checksums = if self.blocks_per_checksum > 0 {
            (index / self.blocks_per_checksum) * self.checksum_size
        } else {
            0
        };
        self.head_size + index * self.block_size + checksums
    }

    fn read_block_at_cursor(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        if let Some(cf) = &mut self.change_file {
            let from_cf = cf
                .seek(self.cursor)
                .and_then(|()| cf.read_block(buf))
                .is_ok();
            if from_cf {
                return Ok(());
            }
        }
        let used = *self
            .bitmap
            .get(self.cursor as usize)
            .ok_or(ImageError::OutOfRange)?;
        if used == 0 {
            buf.fill(0);
            return Ok(());
        }

        let record = self.preceding_used;
        self.file.seek(SeekFrom::Start(self.record_offset(record)))?;
        if self.version == Some(Version::V1) {
            // Stored checksums chain: this record is seeded with the
            // previous record's stored value.
            let seed = if record > 0 {
                self.file.seek(SeekFrom::Current(-(CRC_SIZE as i64)))?;
                let mut prev = [0u8; CRC_SIZE as usize];
                self.file.read_exact(&mut prev)?;
                u32::from_le_bytes(prev)
            } else {
                CRC_CHAIN_SEED
            };
            self.file.read_exact(buf)?;
            let mut stored = [0u8; CRC_SIZE as usize];
            self.file.read_exact(&mut stored)?;
            if crc32_repeat_first(seed, buf) != u32::from_le_bytes(stored) {
                return Err(ImageError::BadRecord);
            }
        } else {
            self.file.read_exact(buf)?;
        }
        self.preceding_used += 1;
        Ok(())
    }

    pub fn read_blocks(&mut self, buf: &mut [u8], nblocks: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        let blocksize = self.block_size as usize;
        for chunk in buf.chunks_exact_mut(blocksize).take(nblocks as usize) {
            self.read_block_at_cursor(chunk)?;
            self.cursor += 1;
        }
        Ok(())
    }

    pub fn block_used(&self) -> Result<bool, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        if let Some(cf) = &self.change_file
            && cf.block_used()
        {
            return Ok(true);
        }
        Ok(self
            .bitmap
            .get(self.cursor as usize)
            .is_some_and(|&b| b != 0))
    }

    fn ensure_change_file(&mut self) -> Result<&mut ChangeFile, ImageError> {
        if self.change_file.is_none() {
            let cf_path = self
                .cf_path
                .clone()
                .unwrap_or_else(|| default_cf_path(&self.path));
            let cf = ChangeFile::create(&cf_path, self.block_size, self.totalblock)?;
            self.cf_path = Some(cf_path);
            self.change_file = Some(cf);
        }
        Ok(self.change_file.as_mut().unwrap())
    }

    pub fn write_blocks(&mut self, buf: &[u8], nblocks: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        if self.mode != OpenMode::ReadWrite {
            return Err(ImageError::NotWritable);
        }
        let blocksize = self.block_size as usize;
        let mut cursor = self.cursor;
        let cf = self.ensure_change_file()?;
        for chunk in buf.chunks_exact(blocksize).take(nblocks as usize) {
            cf.seek(cursor)?;
            cf.write_block(chunk)?;
            cursor += 1;
        }
        self.cursor = cursor;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), ImageError> {
        match &mut self.change_file {
            Some(cf) => cf.sync(),
            None => Err(ImageError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinWrite;
    use std::io::Write as _;

    const BLOCK_SIZE: u32 = 512;

    fn block_data(index: u64) -> Vec<u8> {
        vec![0xB0u8.wrapping_add(index as u8); BLOCK_SIZE as usize]
    }

    fn build_v1(total: u64, used: &[u64]) -> Vec<u8> {
        let header = PartcloneHeaderV1 {
            magic: *PARTCLONE_MAGIC,
            fs: *b"NTFS\0\0\0\0\0\0\0\0\0\0\0",
            version: *b"0001",
            block_size: BLOCK_SIZE as i32,
            device_size: total * BLOCK_SIZE as u64,
            totalblock: total,
            usedblocks: used.len() as u64,
        };
        let mut out = Cursor::new(Vec::new());
        header.write_le(&mut out).unwrap();
        let mut out = out.into_inner();
        assert_eq!(out.len() as u64, PartcloneHeaderV1::SIZE);

        for block in 0..total {
            out.push(used.contains(&block) as u8);
        }
        out.extend_from_slice(BITMAP_MAGIC);

        let mut crc = CRC_CHAIN_SEED;
        for block in 0..total {
            if used.contains(&block) {
                let data = block_data(block);
                crc = crc32_repeat_first(crc, &data);
                out.extend_from_slice(&data);
                out.extend_from_slice(&crc.to_le_bytes());
            }
        }
        out
    }

    fn build_v2(total: u64, used: &[u64], blocks_per_checksum: u32) -> Vec<u8> {
        let header = PartcloneHeaderV2 {
            magic: *b"partclone-image\0",
            ptc_version: *b"0003.00.00\0\0\0\0",
            version: *b"0002",
            endianess: ENDIAN_MAGIC,
            fs: *b"EXTFS\0\0\0\0\0\0\0\0\0\0\0",
            device_size: total * BLOCK_SIZE as u64,
            totalblock: total,
            usedblocks: used.len() as u64,
            used_bitmap: used.len() as u64,
            block_size: BLOCK_SIZE,
            feature_size: PartcloneHeaderV2::SIZE as u32,
            image_version: 2,
            cpu_bits: 64,
            checksum_mode: 32,
            checksum_size: 4,
            blocks_per_checksum,
            reseed_checksum: 1,
            bitmap_mode: BITMAP_MODE_BIT,
            crc: 0,
        };
        let mut out = Cursor::new(Vec::new());
        header.write_le(&mut out).unwrap();
        let mut out = out.into_inner();
        assert_eq!(out.len() as u64, PartcloneHeaderV2::SIZE);

        let mut bm = Bitmap::new(total);
        for &block in used {
            bm.set(block);
        }
        let packed: Vec<u8> = (0..total.div_ceil(8))
            .map(|byte| {
                (0..8).fold(0u8, |acc, bit| {
                    acc | ((bm.get(byte * 8 + bit) as u8) << bit)
                })
            })
            .collect();
        out.extend_from_slice(&packed);
        out.extend_from_slice(&[0u8; 4]); // bitmap checksum, unchecked

        let mut in_run = 0u32;
        for block in 0..total {
            if used.contains(&block) {
                out.extend_from_slice(&block_data(block));
                in_run += 1;
                if in_run == blocks_per_checksum {
                    out.extend_from_slice(&[0u8; 4]);
                    in_run = 0;
                }
            }
        }
        out
    }

    fn write_image(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn test_header_layouts() {
        let v1 = build_v1(1, &[]);
        assert_eq!(v1.len() as u64, PartcloneHeaderV1::SIZE + 1 + 8);
        // block_size must land at offset 36, after the alignment pad.
        assert_eq!(&v1[36..40], &(BLOCK_SIZE as i32).to_le_bytes());
        assert_eq!(&v1[40..48], &(BLOCK_SIZE as u64).to_le_bytes());
    }

    #[test]
    fn test_probe() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = write_image(&dir, "v1.img", &build_v1(4, &[0]));
        PartcloneImage::probe(&v1).unwrap();
        let v2 = write_image(&dir, "v2.img", &build_v2(4, &[0], 1));
        PartcloneImage::probe(&v2).unwrap();

        let mut bad = build_v1(4, &[0]);
        bad[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(b"0009");
        let bad = write_image(&dir, "bad.img", &bad);
        assert!(matches!(
            PartcloneImage::probe(&bad),
            Err(ImageError::Unsupported)
        ));
    }

    #[test]
    fn test_v1_read_used_and_unused() {
        let used = [0u64, 3, 7];
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &build_v1(10, &used));
        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();
        assert_eq!(img.blocksize().unwrap(), BLOCK_SIZE as u64);
        assert_eq!(img.blockcount().unwrap(), 10);
        assert_eq!(img.usedblocks(), 3);

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for block in 0..10u64 {
            img.seek(block).unwrap();
            img.read_blocks(&mut buf, 1).unwrap();
            if used.contains(&block) {
                assert_eq!(buf, block_data(block), "block {block}");
            } else {
                assert_eq!(buf, vec![0u8; BLOCK_SIZE as usize], "block {block}");
            }
        }
    }

    #[test]
    fn test_v1_checksum_chain_in_file() {
        // Property: record i's stored checksum equals the legacy fold of
        // its payload seeded with record i-1's stored checksum.
        let used = [1u64, 2, 5];
        let image = build_v1(8, &used);
        let head = (PartcloneHeaderV1::SIZE + 8 + 8) as usize;
        let record = BLOCK_SIZE as usize + 4;

        let mut prev = CRC_CHAIN_SEED;
        for index in 0..used.len() {
            let payload = &image[head + index * record..head + index * record + BLOCK_SIZE as usize];
            let stored = u32::from_le_bytes(
                image[head + index * record + BLOCK_SIZE as usize
                    ..head + (index + 1) * record]
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(stored, crc32_repeat_first(prev, payload));
            prev = stored;
        }
    }

    #[test]
    fn test_v1_corrupt_record_is_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = build_v1(10, &[0, 3, 7]);
        // Flip a payload byte of the second record (block 3).
        let head = (PartcloneHeaderV1::SIZE + 10 + 8) as usize;
        let record = BLOCK_SIZE as usize + 4;
        data[head + record + 17] ^= 0xFF;
        let path = write_image(&dir, "a.img", &data);

        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        img.seek(3).unwrap();
        assert!(matches!(
            img.read_blocks(&mut buf, 1),
            Err(ImageError::BadRecord)
        ));
        // Other records are unaffected.
        img.seek(7).unwrap();
        img.read_blocks(&mut buf, 1).unwrap();
        assert_eq!(buf, block_data(7));
    }

    #[test]
    fn test_v1_header_fixups() {
        let mut data = build_v1(10, &[0, 3]);
        // Lie about device size and used blocks.
        data[40..48].copy_from_slice(&1u64.to_le_bytes());
        data[56..64].copy_from_slice(&99u64.to_le_bytes());
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &data);

        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();
        assert_eq!(img.device_size(), 10 * BLOCK_SIZE as u64);
        assert_eq!(img.usedblocks(), 2);
    }

    #[test]
    fn test_v1_missing_sentinel() {
        let mut data = build_v1(4, &[0]);
        let at = PartcloneHeaderV1::SIZE as usize + 4;
        data[at..at + 8].copy_from_slice(b"nonsense");
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &data);
        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        assert!(matches!(img.verify(), Err(ImageError::BadRecord)));
    }

    #[test]
    fn test_v1_bucket_boundary_seeks() {
        let used = [0u64, 1000, 1023, 1024, 1030, 2100];
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &build_v1(2200, &used));
        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for &block in used.iter().rev() {
            img.seek(block).unwrap();
            img.read_blocks(&mut buf, 1).unwrap();
            assert_eq!(buf, block_data(block), "block {block}");
        }
    }

    #[test]
    fn test_v2_read_with_checksum_stride() {
        let used = [0u64, 1, 2, 3, 6];
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &build_v2(8, &used, 2));
        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();
        assert_eq!(img.version_str(), "0002");
        assert_eq!(img.fs_tag(), "EXTFS");

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for block in 0..8u64 {
            img.seek(block).unwrap();
            img.read_blocks(&mut buf, 1).unwrap();
            if used.contains(&block) {
                assert_eq!(buf, block_data(block), "block {block}");
            } else {
                assert_eq!(buf, vec![0u8; BLOCK_SIZE as usize], "block {block}");
            }
        }
    }

    #[test]
    fn test_v2_rejects_unknown_bitmap_mode() {
        let mut data = build_v2(8, &[0], 1);
        data[PartcloneHeaderV2::SIZE as usize - 5] = 8; // byte-mode bitmap
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &data);
        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        assert!(matches!(img.verify(), Err(ImageError::Unsupported)));
    }

    #[test]
    fn test_write_lands_in_change_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &build_v1(10, &[0, 3]));
        let original = std::fs::read(&path).unwrap();

        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadWrite).unwrap();
        img.verify().unwrap();
        let data = vec![0x99u8; BLOCK_SIZE as usize];
        img.seek(5).unwrap();
        img.write_blocks(&data, 1).unwrap();
        img.sync().unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        img.seek(5).unwrap();
        img.read_blocks(&mut buf, 1).unwrap();
        assert_eq!(buf, data);
        // Overridden blocks shadow the image even where it has data.
        img.seek(3).unwrap();
        img.write_blocks(&data, 1).unwrap();
        img.seek(3).unwrap();
        img.read_blocks(&mut buf, 1).unwrap();
        assert_eq!(buf, data);
        drop(img);
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_multi_block_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(&dir, "a.img", &build_v1(8, &[1, 2, 5]));
        let mut img = PartcloneImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();

        let bs = BLOCK_SIZE as usize;
        let mut buf = vec![0u8; 5 * bs];
        img.seek(1).unwrap();
        img.read_blocks(&mut buf, 5).unwrap();
        assert_eq!(&buf[0..bs], block_data(1).as_slice());
        assert_eq!(&buf[bs..2 * bs], block_data(2).as_slice());
        assert_eq!(&buf[2 * bs..3 * bs], vec![0u8; bs].as_slice());
        assert_eq!(&buf[3 * bs..4 * bs], vec![0u8; bs].as_slice());
        assert_eq!(&buf[4 * bs..5 * bs], block_data(5).as_slice());
    }
}
