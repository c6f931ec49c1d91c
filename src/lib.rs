#![doc = include_str!("../README.md")]

use std::path::Path;

use thiserror::Error;

pub mod bitmap;
pub mod changefile;
pub mod checksum;
pub mod nbd;
pub mod ntfsclone;
pub mod partclone;
pub mod rawimage;
pub mod sysio;

pub use changefile::ChangeFile;
pub use ntfsclone::NtfsCloneImage;
pub use partclone::PartcloneImage;
pub use rawimage::RawImage;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block not present in change file")]
    NotPresent,
    #[error("bad record: trailer, checksum or atom framing mismatch")]
    BadRecord,
    #[error("block index out of range")]
    OutOfRange,
    #[error("unrecognized or unsupported image format")]
    Unsupported,
    #[error("image is open read-only")]
    NotWritable,
    #[error("out of memory")]
    OutOfMemory,
    #[error("handle is not in a usable state")]
    Invalid,
}

impl From<binrw::Error> for ImageError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(e) => ImageError::Io(e),
            _ => ImageError::BadRecord,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An open snapshot image of whatever format probed successfully.
///
/// The probe order is fixed: ntfsclone, then partclone, then (only when
/// the caller opts in) the raw fallback that accepts anything.
pub enum Image {
    NtfsClone(NtfsCloneImage),
    Partclone(PartcloneImage),
    Raw(RawImage),
}

impl Image {
    pub fn open(
        path: &Path,
        cf_path: Option<&Path>,
        mode: OpenMode,
        raw_allowed: bool,
    ) -> Result<Image, ImageError> {
        if NtfsCloneImage::probe(path).is_ok() {
            return Ok(Image::NtfsClone(NtfsCloneImage::open(path, cf_path, mode)?));
        }
        if PartcloneImage::probe(path).is_ok() {
            return Ok(Image::Partclone(PartcloneImage::open(path, cf_path, mode)?));
        }
        if raw_allowed && RawImage::probe(path).is_ok() {
            return Ok(Image::Raw(RawImage::open(path, cf_path, mode)?));
        }
        Err(ImageError::Unsupported)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Image::NtfsClone(_) => "ntfsclone image",
            Image::Partclone(_) => "partclone image",
            Image::Raw(_) => "raw image",
        }
    }

    pub fn set_tolerant(&mut self) {
        match self {
            Image::NtfsClone(img) => img.set_tolerant(),
            Image::Partclone(img) => img.set_tolerant(),
            Image::Raw(img) => img.set_tolerant(),
        }
    }

    pub fn verify(&mut self) -> Result<(), ImageError> {
        match self {
            Image::NtfsClone(img) => img.verify(),
            Image::Partclone(img) => img.verify(),
            Image::Raw(img) => img.verify(),
        }
    }

    pub fn blocksize(&self) -> Result<u64, ImageError> {
        match self {
            Image::NtfsClone(img) => img.blocksize(),
            Image::Partclone(img) => img.blocksize(),
            Image::Raw(img) => img.blocksize(),
        }
    }

    pub fn blockcount(&self) -> Result<u64, ImageError> {
        match self {
            Image::NtfsClone(img) => img.blockcount(),
            Image::Partclone(img) => img.blockcount(),
            Image::Raw(img) => img.blockcount(),
        }
    }

    pub fn seek(&mut self, block: u64) -> Result<(), ImageError> {
        match self {
            Image::NtfsClone(img) => img.seek(block),
            Image::Partclone(img) => img.seek(block),
            Image::Raw(img) => img.seek(block),
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            Image::NtfsClone(img) => img.tell(),
            Image::Partclone(img) => img.tell(),
            Image::Raw(img) => img.tell(),
        }
    }

    pub fn read_blocks(&mut self, buf: &mut [u8], nblocks: u64) -> Result<(), ImageError> {
        match self {
            Image::NtfsClone(img) => img.read_blocks(buf, nblocks),
            Image::Partclone(img) => img.read_blocks(buf, nblocks),
            Image::Raw(img) => img.read_blocks(buf, nblocks),
        }
    }

    pub fn block_used(&self) -> Result<bool, ImageError> {
        match self {
            Image::NtfsClone(img) => img.block_used(),
            Image::Partclone(img) => img.block_used(),
            Image::Raw(img) => img.block_used(),
        }
    }

    pub fn write_blocks(&mut self, buf: &[u8], nblocks: u64) -> Result<(), ImageError> {
        match self {
            Image::NtfsClone(img) => img.write_blocks(buf, nblocks),
            Image::Partclone(img) => img.write_blocks(buf, nblocks),
            Image::Raw(img) => img.write_blocks(buf, nblocks),
        }
    }

    pub fn sync(&mut self) -> Result<(), ImageError> {
        match self {
            Image::NtfsClone(img) => img.sync(),
            Image::Partclone(img) => img.sync(),
            Image::Raw(img) => img.sync(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_probe_chain_rejects_unknown_without_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0x55u8; 2048])
            .unwrap();

        assert!(matches!(
            Image::open(&path, None, OpenMode::ReadOnly, false),
            Err(ImageError::Unsupported)
        ));
        let img = Image::open(&path, None, OpenMode::ReadOnly, true).unwrap();
        assert_eq!(img.type_name(), "raw image");
    }

    #[test]
    fn test_probe_chain_prefers_real_formats_over_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pc.img");
        // A minimal partclone v1 header prefix is enough for the probe.
        let mut data = vec![0u8; 64];
        data[..15].copy_from_slice(b"partclone-image");
        data[30..34].copy_from_slice(b"0001");
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let img = Image::open(&path, None, OpenMode::ReadOnly, true).unwrap();
        assert_eq!(img.type_name(), "partclone image");
    }

    #[test]
    fn test_round_trip_through_facade() {
        // Invariant: what write_blocks puts in, read_blocks gives back.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&vec![0u8; 512 * 64])
            .unwrap();

        let mut img = Image::open(&path, None, OpenMode::ReadWrite, true).unwrap();
        img.verify().unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        img.seek(10).unwrap();
        img.write_blocks(&data, 2).unwrap();
        img.seek(10).unwrap();
        let mut back = vec![0u8; 1024];
        img.read_blocks(&mut back, 2).unwrap();
        assert_eq!(back, data);
    }
}
