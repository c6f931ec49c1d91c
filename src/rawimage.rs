//! The raw image fallback backend.
//!
//! No header, no bitmap: the file is a flat run of fixed-size blocks and
//! every block is "used". Probing always succeeds, which is why this
//! backend sits last in the probe chain and is only consulted when the
//! caller explicitly allows it. Writes still go through a change file so
//! the source stays pristine.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::changefile::{ChangeFile, default_cf_path};
use crate::sysio::{SysFile, SysOpenMode};
use crate::{ImageError, OpenMode};

const RAW_BLOCKSIZE: u64 = 512;
const RAW_LARGE_BLOCKSIZE: u64 = 4096;
/// Above this file size the 512-byte block count gets unwieldy; switch
/// to 4 KiB blocks.
const RAW_LARGE_THRESHOLD: u64 = 100_000_000_000;

pub struct RawImage {
    file: SysFile,
    path: PathBuf,
    cf_path: Option<PathBuf>,
    change_file: Option<ChangeFile>,
    mode: OpenMode,
    blocksize: u64,
    blockcount: u64,
    cursor: u64,
    verified: bool,
}

impl RawImage {
    /// Succeeds for anything openable; the caller gates this behind an
    /// explicit opt-in.
    pub fn probe(path: &Path) -> Result<(), ImageError> {
        let mut image = RawImage::open(path, None, OpenMode::ReadOnly)?;
        image.verify()
    }

    pub fn open(
        path: &Path,
        cf_path: Option<&Path>,
        mode: OpenMode,
    ) -> Result<RawImage, ImageError> {
        let mut file = SysFile::open(path, SysOpenMode::ReadOnly)?;
        let size = file.size()?;
        let blocksize = if size > RAW_LARGE_THRESHOLD {
            RAW_LARGE_BLOCKSIZE
        } else {
            RAW_BLOCKSIZE
        };
        Ok(RawImage {
            file,
            path: path.to_path_buf(),
            cf_path: cf_path.map(Path::to_path_buf),
            change_file: None,
            mode,
            blocksize,
            blockcount: size / blocksize,
            cursor: 0,
            verified: false,
        })
    }

    pub fn set_tolerant(&mut self) {}

    pub fn verify(&mut self) -> Result<(), ImageError> {
        if let Some(cf_path) = &self.cf_path
            && self.mode == OpenMode::ReadWrite
            && let Ok(mut cf) = ChangeFile::open(cf_path, self.blocksize, self.blockcount)
        {
            cf.verify()?;
            self.change_file = Some(cf);
        }
        self.verified = true;
        Ok(())
    }

    pub fn blocksize(&self) -> Result<u64, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        Ok(self.blocksize)
    }

    pub fn blockcount(&self) -> Result<u64, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        Ok(self.blockcount)
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn seek(&mut self, block: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        if block > self.blockcount {
            return Err(ImageError::OutOfRange);
        }
        self.cursor = block;
        if let Some(cf) = &mut self.change_file {
            cf.seek(block)?;
        }
        Ok(())
    }

    pub fn read_blocks(&mut self, buf: &mut [u8], nblocks: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        let blocksize = self.blocksize as usize;
        if self.change_file.is_some() {
            for chunk in buf.chunks_exact_mut(blocksize).take(nblocks as usize) {
                let cf = self.change_file.as_mut().unwrap();
                match cf.seek(self.cursor).and_then(|()| cf.read_block(chunk)) {
                    Ok(()) => {}
                    Err(ImageError::NotPresent) => {
                        self.file
                            .seek(SeekFrom::Start(self.cursor * self.blocksize))?;
                        self.file.read_exact(chunk)?;
                    }
                    Err(e) => return Err(e),
                }
                self.cursor += 1;
            }
        } else {
            self.file
                .seek(SeekFrom::Start(self.cursor * self.blocksize))?;
            self.file
                .read_exact(&mut buf[..nblocks as usize * blocksize])?;
            self.cursor += nblocks;
        }
        Ok(())
    }

    pub fn block_used(&self) -> Result<bool, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        if self.cursor < self.blockcount {
            Ok(true)
        } else {
            Err(ImageError::OutOfRange)
        }
    }

    fn ensure_change_file(&mut self) -> Result<&mut ChangeFile, ImageError> {
        if self.change_file.is_none() {
            let cf_path = self
                .cf_path
                .clone()
                .unwrap_or_else(|| default_cf_path(&self.path));
            let cf = ChangeFile::create(&cf_path, self.blocksize, self.blockcount)?;
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
        let blocksize = self.blocksize as usize;
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
    use std::io::Write as _;

    fn write_raw(dir: &tempfile::TempDir, blocks: u64) -> PathBuf {
        let path = dir.path().join("disk.raw");
        let mut f = std::fs::File::create(&path).unwrap();
        for block in 0..blocks {
            f.write_all(&vec![block as u8; RAW_BLOCKSIZE as usize])
                .unwrap();
        }
        path
    }

    #[test]
    fn test_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, 16);
        let mut img = RawImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();
        assert_eq!(img.blocksize().unwrap(), 512);
        assert_eq!(img.blockcount().unwrap(), 16);
    }

    #[test]
    fn test_probe_accepts_anything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"anything at all")
            .unwrap();
        RawImage::probe(&path).unwrap();
    }

    #[test]
    fn test_read_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, 16);
        let mut img = RawImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();

        let mut buf = vec![0u8; 2 * RAW_BLOCKSIZE as usize];
        img.seek(3).unwrap();
        img.read_blocks(&mut buf, 2).unwrap();
        assert_eq!(&buf[..512], vec![3u8; 512].as_slice());
        assert_eq!(&buf[512..], vec![4u8; 512].as_slice());
        assert_eq!(img.tell(), 5);
    }

    #[test]
    fn test_write_overlays_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, 16);
        let original = std::fs::read(&path).unwrap();

        let mut img = RawImage::open(&path, None, OpenMode::ReadWrite).unwrap();
        img.verify().unwrap();
        let data = vec![0xEEu8; 512];
        img.seek(3).unwrap();
        img.write_blocks(&data, 1).unwrap();

        let mut buf = vec![0u8; 2 * 512];
        img.seek(2).unwrap();
        img.read_blocks(&mut buf, 2).unwrap();
        assert_eq!(&buf[..512], vec![2u8; 512].as_slice()); // untouched, from image
        assert_eq!(&buf[512..], data.as_slice()); // overridden, from change file
        drop(img);
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_block_used_in_and_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_raw(&dir, 4);
        let mut img = RawImage::open(&path, None, OpenMode::ReadOnly).unwrap();
        img.verify().unwrap();
        img.seek(3).unwrap();
        assert!(img.block_used().unwrap());
        img.seek(4).unwrap();
        assert!(matches!(img.block_used(), Err(ImageError::OutOfRange)));
    }
}
