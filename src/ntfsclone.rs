//! The ntfsclone image backend (format versions 10.0 and 10.1).
//!
//! An ntfsclone image is a 50-byte header followed by a stream of atoms:
//! a type byte plus an 8-byte union. Type 0 is a run of empty clusters
//! (the union is the run length), type 1 is one used cluster whose data
//! starts inside the union itself (the 8 union bytes are the first 8
//! bytes of cluster data). There is no bitmap in the file, so `verify`
//! walks the stream once to build one, recording the file offset of the
//! first used cluster in every 1024-cluster bucket so later seeks only
//! ever walk one bucket's worth of atoms.
//!
//! The image logically ends with one extra cluster mirroring cluster 0.
//! Version 10.1 stores it; 10.0 does not, and reads of it are redirected
//! to cluster 0.

use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};

use binrw::{BinRead, binrw};
use log::{debug, warn};

use crate::bitmap::Bitmap;
use crate::changefile::{ChangeFile, default_cf_path};
use crate::sysio::{SysFile, SysOpenMode};
use crate::{ImageError, OpenMode};

pub const NTFSCLONE_MAGIC: [u8; 16] = *b"\0ntfsclone-image";

/// (major, minor) pairs this backend understands.
const SUPPORTED_VERSIONS: [(u8, u8); 2] = [(10, 0), (10, 1)];

/// Atoms are a type byte plus an 8-byte union.
const ATOM_SIZE: u64 = 9;
/// Data of a used cluster starts right after the type byte.
const ATOM_TO_DATA_OFFSET: u64 = 1;
/// Buckets cover `1 << BUCKET_FACTOR` clusters each.
const BUCKET_FACTOR: u32 = 10;
/// Tolerant mode gives up after this many consecutive unparseable atoms.
const MAX_DESYNC_ATOMS: u32 = 128;
/// Fill byte for clusters the image does not contain.
const INVALID_FILL: u8 = 0x45;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NtfsCloneHeader {
    magic: [u8; 16],
    major_ver: u8,
    minor_ver: u8,
    cluster_size: u32,
    device_size: i64,
    nr_clusters: i64,
    inuse: i64,
    offset_to_image_data: u32, /* from start of header */
}

impl NtfsCloneHeader {
    pub const SIZE: u64 = 50;

    pub fn major_ver(&self) -> u8 {
        self.major_ver
    }

    pub fn minor_ver(&self) -> u8 {
        self.minor_ver
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn device_size(&self) -> i64 {
        self.device_size
    }

    pub fn nr_clusters(&self) -> i64 {
        self.nr_clusters
    }

    pub fn inuse(&self) -> i64 {
        self.inuse
    }
}

pub struct NtfsCloneImage {
    file: SysFile,
    path: PathBuf,
    cf_path: Option<PathBuf>,
    change_file: Option<ChangeFile>,
    mode: OpenMode,
    tolerant: bool,
    header: Option<NtfsCloneHeader>,
    /// Cluster count including the virtual trailing cluster; set by verify.
    nr_clusters: u64,
    bitmap: Bitmap,
    /// File offset of the first used cluster's atom per bucket, 0 = none.
    bucket_offset: Vec<u64>,
    current_bucket: u64,
    /// Free clusters at the start of the current bucket, up to the last
    /// sought block.
    leading_free: u64,
    cursor: u64,
    verified: bool,
    ivblock: Vec<u8>,
}

fn read_header(file: &mut SysFile) -> Result<NtfsCloneHeader, ImageError> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = [0u8; NtfsCloneHeader::SIZE as usize];
    file.read_exact(&mut raw)?;
    let header = NtfsCloneHeader::read_le(&mut Cursor::new(&raw))?;
    if header.magic != NTFSCLONE_MAGIC {
        return Err(ImageError::Unsupported);
    }
    if !SUPPORTED_VERSIONS.contains(&(header.major_ver, header.minor_ver)) {
        return Err(ImageError::Unsupported);
    }
    if header.cluster_size == 0 || header.nr_clusters <= 0 {
        return Err(ImageError::Unsupported);
    }
    Ok(header)
}

impl NtfsCloneImage {
    /// Header-only check: is this an ntfsclone image we can handle?
    pub fn probe(path: &Path) -> Result<(), ImageError> {
        let mut file = SysFile::open(path, SysOpenMode::ReadOnly)?;
        read_header(&mut file).map(|_| ())
    }

    pub fn open(
        path: &Path,
        cf_path: Option<&Path>,
        mode: OpenMode,
    ) -> Result<NtfsCloneImage, ImageError> {
        let file = SysFile::open(path, SysOpenMode::ReadOnly)?;
        Ok(NtfsCloneImage {
            file,
            path: path.to_path_buf(),
            cf_path: cf_path.map(Path::to_path_buf),
            change_file: None,
            mode,
            tolerant: false,
            header: None,
            nr_clusters: 0,
            bitmap: Bitmap::new(0),
            bucket_offset: Vec::new(),
            // Sentinel: the first seek must compute leading_free.
            current_bucket: u64::MAX,
            leading_free: 0,
            cursor: 0,
            verified: false,
            ivblock: Vec::new(),
        })
    }

    /// Skip over unparseable atoms during verify instead of failing.
    pub fn set_tolerant(&mut self) {
        self.tolerant = true;
    }

    /// Full verification: parse the header, scan the atom stream to
    /// build the usage bitmap and bucket index, and attach the change
    /// file if one was named and we are writable.
    pub fn verify(&mut self) -> Result<(), ImageError> {
        let header = read_header(&mut self.file)?;
        let cluster_size = header.cluster_size as u64;
        // One extra for the trailing mirror of cluster 0.
        self.nr_clusters = header.nr_clusters as u64 + 1;
        self.bitmap = Bitmap::new(self.nr_clusters);
        self.bucket_offset = vec![0u64; ((self.nr_clusters >> BUCKET_FACTOR) + 1) as usize];

        if let Some(cf_path) = &self.cf_path
            && self.mode == OpenMode::ReadWrite
            && let Ok(cf) = ChangeFile::open(cf_path, cluster_size, self.nr_clusters)
        {
            // Verified below; if the open itself fails we create the
            // change file on first write instead.
            self.change_file = Some(cf);
        }

        self.file
            .seek(SeekFrom::Start(header.offset_to_image_data as u64))?;
        let mut cluster = 0u64;
        let mut desync = 0u32;
        while cluster < self.nr_clusters {
            let mut atom = [0u8; ATOM_SIZE as usize];
            let got = self.file.read_fully(&mut atom)?;
            if got < atom.len() {
                // 10.0 images end one cluster short of the virtual
                // trailing cluster; anything past EOF reads as unused.
                break;
            }
            match atom[0] {
                0 => {
                    desync = 0;
                    cluster += u64::from_le_bytes(atom[1..9].try_into().unwrap());
                }
                1 => {
                    desync = 0;
                    let pos = self
                        .file
                        .seek(SeekFrom::Current(cluster_size as i64 - 8))?;
                    self.bitmap.set(cluster);
                    let bucket = (cluster >> BUCKET_FACTOR) as usize;
                    if self.bucket_offset[bucket] == 0 {
                        self.bucket_offset[bucket] = pos - cluster_size - ATOM_TO_DATA_OFFSET;
                    }
                    cluster += 1;
                }
                other => {
                    if !self.tolerant {
                        debug!("atom type {other} at cluster {cluster}");
                        return Err(ImageError::BadRecord);
                    }
                    desync += 1;
                    if desync > MAX_DESYNC_ATOMS {
                        warn!("giving up atom resync after {MAX_DESYNC_ATOMS} atoms");
                        break;
                    }
                }
            }
        }

        if let Some(cf) = &mut self.change_file {
            cf.verify()?;
        }

        self.ivblock = vec![INVALID_FILL; cluster_size as usize];
        self.header = Some(header);
        self.cursor = 0;
        self.current_bucket = u64::MAX;
        self.leading_free = 0;
        self.verified = true;
        Ok(())
    }

    pub fn header(&self) -> Option<&NtfsCloneHeader> {
        self.header.as_ref()
    }

    pub fn blocksize(&self) -> Result<u64, ImageError> {
        let header = self.header.as_ref().ok_or(ImageError::Invalid)?;
        Ok(header.cluster_size as u64)
    }

    pub fn blockcount(&self) -> Result<u64, ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        Ok(self.nr_clusters)
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn seek(&mut self, block: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        if block > self.nr_clusters {
            return Err(ImageError::OutOfRange);
        }
        let header = self.header.as_ref().ok_or(ImageError::Invalid)?;
        let mut target = block;
        // 10.0 images do not store the trailing cluster; it mirrors
        // cluster 0.
        if header.minor_ver == 0 && target + 1 == self.nr_clusters {
            target = 0;
        }

        let bucket = target >> BUCKET_FACTOR;
        if bucket != self.current_bucket {
            let start = bucket << BUCKET_FACTOR;
            let mut free = 0u64;
            while !self.bitmap.get(start + free) && start + free < target {
                free += 1;
            }
            self.leading_free = free;
            self.current_bucket = bucket;
        }
        self.cursor = target;

        if let Some(cf) = &mut self.change_file {
            cf.seek(target)?;
        }
        Ok(())
    }

    /// Position the file cursor at the data of `cluster`, walking atoms
    /// forward from the bucket anchor.
    fn seek_to_cluster(&mut self, cluster: u64) -> Result<(), ImageError> {
        let header = self.header.as_ref().ok_or(ImageError::Invalid)?;
        let cluster_size = header.cluster_size as u64;
        let bucket = cluster >> BUCKET_FACTOR;
        let anchor = self.bucket_offset[bucket as usize];
        if anchor == 0 || !self.bitmap.get(cluster) {
            return Err(ImageError::Invalid);
        }

        // The anchor points at the first used cluster in the bucket;
        // figure out which logical cluster that is.
        let mut pos = if bucket == self.current_bucket {
            (bucket << BUCKET_FACTOR) + self.leading_free
        } else {
            let mut p = cluster & !((1u64 << BUCKET_FACTOR) - 1);
            while !self.bitmap.get(p) {
                p += 1;
            }
            p
        };

        self.file.seek(SeekFrom::Start(anchor))?;
        while pos < cluster {
            let mut atom = [0u8; ATOM_SIZE as usize];
            self.file.read_exact(&mut atom)?;
            match atom[0] {
                0 => pos += u64::from_le_bytes(atom[1..9].try_into().unwrap()),
                1 => {
                    self.file.seek(SeekFrom::Current(cluster_size as i64 - 8))?;
                    pos += 1;
                }
                _ => return Err(ImageError::BadRecord),
            }
        }
        if pos != cluster {
            // An empty run carried us past a cluster the bitmap says is
            // used; the stream and the bitmap disagree.
            return Err(ImageError::BadRecord);
        }
        self.file.seek(SeekFrom::Current(ATOM_TO_DATA_OFFSET as i64))?;
        Ok(())
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
        if self.bitmap.get(self.cursor) {
            self.seek_to_cluster(self.cursor)?;
            self.file.read_exact(buf)?;
        } else {
            buf.copy_from_slice(&self.ivblock);
        }
        Ok(())
    }

    pub fn read_blocks(&mut self, buf: &mut [u8], nblocks: u64) -> Result<(), ImageError> {
        if !self.verified {
            return Err(ImageError::Invalid);
        }
        let blocksize = self.blocksize()? as usize;
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
        Ok(self.bitmap.get(self.cursor))
    }

    fn ensure_change_file(&mut self) -> Result<&mut ChangeFile, ImageError> {
        if self.change_file.is_none() {
            let cf_path = self
                .cf_path
                .clone()
                .unwrap_or_else(|| default_cf_path(&self.path));
            let blocksize = self.blocksize()?;
            let cf = ChangeFile::create(&cf_path, blocksize, self.nr_clusters)?;
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
        let blocksize = self.blocksize()? as usize;
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
