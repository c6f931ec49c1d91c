//! NBD transport: wire framing, kernel attach, and the request loop.
//!
//! The kernel end of a socketpair is handed to `/dev/nbdX` via ioctl and
//! a forked child parks in `NBD_DO_IT`; we keep the other end and answer
//! requests on it, one at a time. NBD requests are byte ranges with no
//! alignment guarantees, so every request is widened to whole blocks
//! against the image layer, and misaligned writes first prime the edge
//! blocks with their current contents.
//!
//! Shutdown is a little state machine: a termination signal or a
//! disconnect request starts the wind-down; if a filesystem was mounted
//! on top of us a child is forked to unmount it and the loop keeps
//! serving the requests that unmount generates until the child exits.

use std::io::{Cursor, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use binrw::{BinRead, BinWrite, binrw};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount, umount2};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::{Image, ImageError};

pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;

/// All fields big-endian on the wire.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct NbdRequest {
    pub magic: u32,
    pub command: u32,
    pub handle: [u8; 8],
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE: usize = 28;
}

#[binrw]
#[brw(big)]
#[derive(Debug, Clone)]
pub struct NbdReply {
    pub magic: u32,
    pub error: u32,
    pub handle: [u8; 8],
}

impl NbdReply {
    pub const SIZE: usize = 16;
}

/// Core errors cross the wire as errno values in the reply header.
fn wire_error(err: &ImageError) -> u32 {
    let errno = match err {
        ImageError::Io(e) => return e.raw_os_error().unwrap_or(Errno::EIO as i32) as u32,
        ImageError::NotPresent | ImageError::OutOfRange => Errno::ENXIO,
        ImageError::BadRecord => Errno::ESRCH,
        ImageError::Unsupported => Errno::ENODEV,
        ImageError::NotWritable => Errno::EROFS,
        ImageError::OutOfMemory => Errno::ENOMEM,
        ImageError::Invalid => Errno::EINVAL,
    };
    errno as i32 as u32
}

fn nix_err(errno: Errno) -> ImageError {
    ImageError::Io(std::io::Error::from_raw_os_error(errno as i32))
}

/* _IO(0xab, n) requests from the kernel's nbd interface. */
const NBD_SET_SOCK: libc::c_ulong = 0xab00;
const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
const NBD_DO_IT: libc::c_ulong = 0xab03;
const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
const NBD_DISCONNECT: libc::c_ulong = 0xab08;
const NBD_SET_TIMEOUT: libc::c_ulong = 0xab09;

fn nbd_ioctl(fd: i32, request: libc::c_ulong, arg: libc::c_ulong) -> Result<(), ImageError> {
    let rc = unsafe { libc::ioctl(fd, request as _, arg) };
    if rc == -1 {
        Err(ImageError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CHILD_EVENTS: AtomicU32 = AtomicU32::new(0);
static DEAD_CHILD: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_terminate(_signo: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_child(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if !info.is_null() {
        let pid = unsafe { (*info).si_pid() };
        DEAD_CHILD.store(pid, Ordering::SeqCst);
    }
    CHILD_EVENTS.fetch_add(1, Ordering::SeqCst);
}

/// SIGINT/SIGHUP/SIGTERM/SIGQUIT request an orderly shutdown; SIGCHLD
/// records the dead pid for the loop to reap. Neither handler restarts
/// the interrupted socket read, which is how the loop notices the flags.
pub fn install_signal_handlers() -> Result<(), ImageError> {
    let term = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let child = SigAction::new(
        SigHandler::SigAction(on_child),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe {
        for signal in [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM, Signal::SIGQUIT] {
            sigaction(signal, &term).map_err(nix_err)?;
        }
        sigaction(Signal::SIGCHLD, &child).map_err(nix_err)?;
    }
    Ok(())
}

/// Reap whatever child the SIGCHLD handler recorded. Returns the reaped
/// pid, if any.
fn reap_dead_children() -> Option<Pid> {
    if CHILD_EVENTS.swap(0, Ordering::SeqCst) == 0 {
        return None;
    }
    let recorded = DEAD_CHILD.swap(0, Ordering::SeqCst);
    let target = if recorded > 0 {
        Pid::from_raw(recorded)
    } else {
        Pid::from_raw(-1)
    };
    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => {
            let pid = status.pid();
            debug!("reaped child {pid:?}: {status:?}");
            pid
        }
        Err(_) => None,
    }
}

/// A kernel NBD device wired to our half of a socketpair, with the
/// `NBD_DO_IT` child already running.
pub struct NbdConnection {
    device: std::fs::File,
    pub socket: UnixStream,
    doit_pid: Pid,
}

impl NbdConnection {
    pub fn connect(
        device_path: &Path,
        blocksize: u64,
        blockcount: u64,
        timeout_secs: Option<u64>,
    ) -> Result<NbdConnection, ImageError> {
        let (kernel_end, service_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(nix_err)?;
        let device = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)?;
        let fd = device.as_raw_fd();

        if let Some(timeout) = timeout_secs {
            // Avoid the kernel dropping us as a slow server. Old kernels
            // may not know the ioctl; that is not fatal.
            match nbd_ioctl(fd, NBD_SET_TIMEOUT, timeout as libc::c_ulong) {
                Ok(()) => info!("request timeout set to {timeout}s"),
                Err(e) => warn!("NBD_SET_TIMEOUT failed: {e}"),
            }
        }
        nbd_ioctl(fd, NBD_CLEAR_SOCK, 0)?;
        nbd_ioctl(fd, NBD_SET_SOCK, kernel_end.as_raw_fd() as libc::c_ulong)?;
        nbd_ioctl(fd, NBD_SET_BLKSIZE, blocksize as libc::c_ulong)?;
        nbd_ioctl(fd, NBD_SET_SIZE_BLOCKS, blockcount as libc::c_ulong)?;

        match unsafe { fork() }.map_err(nix_err)? {
            ForkResult::Child => {
                drop(service_end);
                // Parks until NBD_DISCONNECT.
                let _ = nbd_ioctl(fd, NBD_DO_IT, 0);
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                drop(kernel_end);
                debug!("NBD_DO_IT child is {child}");
                Ok(NbdConnection {
                    device,
                    socket: UnixStream::from(service_end),
                    doit_pid: child,
                })
            }
        }
    }

    pub fn disconnect(&self) {
        if let Err(e) = nbd_ioctl(self.device.as_raw_fd(), NBD_DISCONNECT, 0) {
            warn!("NBD_DISCONNECT failed: {e}");
        }
    }

    pub fn doit_pid(&self) -> Pid {
        self.doit_pid
    }
}

/// Fork a child to mount `device` on `mountpoint`.
pub fn spawn_mount(
    device: &Path,
    mountpoint: &Path,
    fstype: &str,
    readonly: bool,
) -> Result<Pid, ImageError> {
    match unsafe { fork() }.map_err(nix_err)? {
        ForkResult::Child => {
            let flags = if readonly {
                MsFlags::MS_RDONLY
            } else {
                MsFlags::empty()
            };
            let status = match mount(Some(device), mountpoint, Some(fstype), flags, None::<&str>) {
                Ok(()) => 0,
                Err(errno) => errno as i32,
            };
            unsafe { libc::_exit(status) }
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Fork a child to unmount `mountpoint`; `force` after a service error.
pub fn spawn_umount(mountpoint: &Path, force: bool) -> Result<Pid, ImageError> {
    match unsafe { fork() }.map_err(nix_err)? {
        ForkResult::Child => {
            let result = if force {
                umount2(mountpoint, MntFlags::MNT_FORCE)
            } else {
                umount(mountpoint)
            };
            let status = match result {
                Ok(()) => 0,
                Err(errno) => errno as i32,
            };
            unsafe { libc::_exit(status) }
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

const SCRATCH_INITIAL: usize = 8192;
/// At and above this, allocation failures are not retried.
const SCRATCH_LIMIT: u64 = 0x8000_0000;
const ALLOC_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Serving requests.
    Running,
    /// Shutdown requested; fork the unmount if there is one.
    Winddown,
    /// Unmount child running; keep serving its flush requests.
    Draining,
    /// All done.
    Done,
}

enum ReadOutcome {
    Request([u8; NbdRequest::SIZE]),
    Interrupted,
    Closed,
}

/// The single-threaded request loop. Generic over the socket so tests
/// can drive it over a plain `UnixStream` pair.
pub struct RequestLoop<'a, S: Read + Write> {
    image: &'a mut Image,
    sock: S,
    blocksize: u64,
    offsetmask: u64,
    blockmask: u64,
    scratch: Vec<u8>,
    /// Mounted filesystem to unwind during shutdown.
    mount: Option<PathBuf>,
}

impl<'a, S: Read + Write> RequestLoop<'a, S> {
    pub fn new(
        image: &'a mut Image,
        sock: S,
        mount: Option<PathBuf>,
    ) -> Result<RequestLoop<'a, S>, ImageError> {
        let blocksize = image.blocksize()?;
        Ok(RequestLoop {
            image,
            sock,
            blocksize,
            offsetmask: blocksize - 1,
            blockmask: !(blocksize - 1),
            scratch: vec![0u8; SCRATCH_INITIAL],
            mount,
        })
    }

    /// Serve until disconnected, signalled, or out of memory.
    pub fn run(&mut self) -> Result<(), ImageError> {
        let mut stage = Stage::Running;
        let mut fatal: Option<ImageError> = None;
        let mut last_errored = false;

        while stage != Stage::Done {
            if reap_dead_children().is_some() && stage == Stage::Draining {
                stage = Stage::Done;
                continue;
            }

            if stage != Stage::Winddown {
                match self.read_request() {
                    ReadOutcome::Request(raw) => {
                        self.handle_request(raw, &mut stage, &mut fatal, &mut last_errored);
                    }
                    ReadOutcome::Interrupted => {}
                    ReadOutcome::Closed => {
                        if stage == Stage::Running {
                            info!("request socket closed by peer");
                            stage = Stage::Winddown;
                        } else {
                            // Nothing left to read; wait for the unmount
                            // child without spinning.
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            }

            if SHUTDOWN.load(Ordering::SeqCst) && stage == Stage::Running {
                info!("termination signal received");
                stage = Stage::Winddown;
            }

            if stage == Stage::Winddown {
                stage = match &self.mount {
                    Some(mountpoint) => match spawn_umount(mountpoint, last_errored) {
                        Ok(_pid) => Stage::Draining,
                        Err(e) => {
                            error!("cannot fork to unmount: {e}");
                            Stage::Done
                        }
                    },
                    None => Stage::Done,
                };
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_request(&mut self) -> ReadOutcome {
        let mut raw = [0u8; NbdRequest::SIZE];
        let mut got = 0;
        while got < raw.len() {
            match self.sock.read(&mut raw[got..]) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if SHUTDOWN.load(Ordering::SeqCst) || CHILD_EVENTS.load(Ordering::SeqCst) != 0 {
                        return ReadOutcome::Interrupted;
                    }
                }
                Err(e) => {
                    warn!("request read error: {e}");
                    return ReadOutcome::Interrupted;
                }
            }
        }
        ReadOutcome::Request(raw)
    }

    fn handle_request(
        &mut self,
        raw: [u8; NbdRequest::SIZE],
        stage: &mut Stage,
        fatal: &mut Option<ImageError>,
        last_errored: &mut bool,
    ) {
        let request = match NbdRequest::read_be(&mut Cursor::new(&raw)) {
            Ok(request) => request,
            Err(_) => return,
        };
        if request.magic != NBD_REQUEST_MAGIC {
            // Out of sync with the peer. Reading on until another magic
            // lines up is the best we can do; do not reply.
            warn!("bad request magic {:#010x}, resyncing", request.magic);
            return;
        }

        let offset = request.offset;
        let length = request.length as u64;
        let start_block_offs = offset & self.blockmask;
        let sboffs = offset & self.offsetmask;
        let end = offset.wrapping_add(length).wrapping_sub(1);
        let eboffs = end & self.offsetmask;
        let start_block = start_block_offs / self.blocksize;
        let block_count = if length > 0 {
            ((end & self.blockmask) - start_block_offs) / self.blocksize + 1
        } else {
            0
        };

        let mut error = 0u32;
        if let Err(e) = self.ensure_scratch(block_count * self.blocksize) {
            error = wire_error(&e);
            *fatal = Some(e);
            *stage = Stage::Winddown;
        }

        if error == 0 {
            match request.command {
                NBD_CMD_DISC => {
                    info!("disconnect requested");
                    *stage = Stage::Winddown;
                }
                NBD_CMD_READ => {
                    debug!("read {length:#x} @ {offset:#x}");
                    if let Err(e) = self.do_read(start_block, block_count) {
                        warn!("read failed: {e}");
                        error = wire_error(&e);
                    }
                }
                NBD_CMD_WRITE => {
                    debug!("write {length:#x} @ {offset:#x}");
                    if let Err(e) = self.do_write(start_block, block_count, sboffs, eboffs, length)
                    {
                        warn!("write failed: {e}");
                        error = wire_error(&e);
                    }
                }
                other => {
                    warn!("unknown request type {other}");
                    error = Errno::EINVAL as i32 as u32;
                }
            }
        }

        let reply = NbdReply {
            magic: NBD_REPLY_MAGIC,
            error,
            handle: request.handle,
        };
        let mut raw_reply = Cursor::new([0u8; NbdReply::SIZE]);
        reply.write_be(&mut raw_reply).expect("fixed-size reply");
        if let Err(e) = self.write_full(&raw_reply.into_inner()) {
            warn!("reply write error: {e}");
        } else if request.command == NBD_CMD_READ && error == 0 && length > 0 {
            let payload_at = sboffs as usize;
            let payload = payload_at..payload_at + length as usize;
            if let Err(e) = Self::write_full_to(&mut self.sock, &self.scratch[payload]) {
                warn!("reply payload write error: {e}");
            }
        }
        *last_errored = error != 0;
    }

    fn do_read(&mut self, start_block: u64, block_count: u64) -> Result<(), ImageError> {
        if block_count == 0 {
            return Ok(());
        }
        self.image.seek(start_block)?;
        let span = (block_count * self.blocksize) as usize;
        self.image.read_blocks(&mut self.scratch[..span], block_count)
    }

    fn do_write(
        &mut self,
        start_block: u64,
        block_count: u64,
        sboffs: u64,
        eboffs: u64,
        length: u64,
    ) -> Result<(), ImageError> {
        if block_count == 0 {
            return Ok(());
        }
        let blocksize = self.blocksize as usize;
        if sboffs != 0 {
            // Partial leading block: prime it with current contents.
            self.image.seek(start_block)?;
            self.image.read_blocks(&mut self.scratch[..blocksize], 1)?;
        }
        if eboffs != self.offsetmask && block_count > 1 {
            // Partial trailing block too.
            let last = ((block_count - 1) * self.blocksize) as usize;
            self.image.seek(start_block + block_count - 1)?;
            self.image
                .read_blocks(&mut self.scratch[last..last + blocksize], 1)?;
        }

        self.read_payload(sboffs as usize, length as usize)?;

        self.image.seek(start_block)?;
        let span = (block_count * self.blocksize) as usize;
        self.image.write_blocks(&self.scratch[..span], block_count)
    }

    /// Pull the write payload off the socket into the scratch buffer at
    /// its in-block offset.
    fn read_payload(&mut self, at: usize, length: usize) -> Result<(), ImageError> {
        let buf = &mut self.scratch[at..at + length];
        let mut got = 0;
        while got < length {
            match self.sock.read(&mut buf[got..]) {
                Ok(0) => {
                    return Err(ImageError::Io(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )));
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if SHUTDOWN.load(Ordering::SeqCst) {
                        return Err(ImageError::Io(e));
                    }
                }
                Err(e) => return Err(ImageError::Io(e)),
            }
        }
        Ok(())
    }

    fn write_full(&mut self, data: &[u8]) -> Result<(), ImageError> {
        Self::write_full_to(&mut self.sock, data)
    }

    fn write_full_to(sock: &mut S, data: &[u8]) -> Result<(), ImageError> {
        let mut written = 0;
        while written < data.len() {
            match sock.write(&data[written..]) {
                Ok(0) => {
                    return Err(ImageError::Io(std::io::Error::from(
                        std::io::ErrorKind::WriteZero,
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    if SHUTDOWN.load(Ordering::SeqCst) {
                        return Err(ImageError::Io(e));
                    }
                }
                Err(e) => return Err(ImageError::Io(e)),
            }
        }
        Ok(())
    }

    /// Grow the scratch buffer to at least `needed` bytes, retrying
    /// allocation pressure with a long backoff. Requests of 2 GiB and up
    /// are not retried.
    fn ensure_scratch(&mut self, needed: u64) -> Result<(), ImageError> {
        while (self.scratch.len() as u64) < needed {
            if needed >= SCRATCH_LIMIT {
                error!("not retrying allocation of {needed} byte buffer");
                return Err(ImageError::OutOfMemory);
            }
            let additional = needed as usize - self.scratch.len();
            match self.scratch.try_reserve_exact(additional) {
                Ok(()) => self.scratch.resize(needed as usize, 0),
                Err(_) => {
                    warn!("retrying allocation of {needed} byte buffer");
                    thread::sleep(ALLOC_RETRY);
                }
            }
        }
        Ok(())
    }
}
