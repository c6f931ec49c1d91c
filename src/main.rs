use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use nix::unistd::daemon;

use snapimage::changefile::default_cf_path;
use snapimage::nbd::{self, NbdConnection, RequestLoop};
use snapimage::{ChangeFile, Image, ImageError, OpenMode};

#[derive(Parser)]
#[command(name = "snapimage", version, about = "Block access to sparse disk-image snapshots")]
struct Cli {
    /// More -v, more detail
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach an image to a kernel NBD device and serve requests
    Serve(ServeArgs),
    /// Probe an image and print its header
    Info(InfoArgs),
    /// Walk a change file and verify every stored record
    Changes(ChangesArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Image file to serve
    #[arg(short = 'f', long)]
    image: PathBuf,
    /// Change file (default: <image>.cf)
    #[arg(short = 'c', long)]
    change_file: Option<PathBuf>,
    /// NBD device to attach, e.g. /dev/nbd0
    #[arg(short = 'd', long)]
    device: PathBuf,
    /// Mount the device here once attached
    #[arg(short = 'm', long)]
    mount: Option<PathBuf>,
    /// Filesystem type for the mount
    #[arg(short = 't', long, default_value = "ext2")]
    fstype: String,
    /// NBD request timeout in seconds
    #[arg(short = 'i', long)]
    timeout: Option<u64>,
    /// Serve read-only
    #[arg(short = 'r', long)]
    read_only: bool,
    /// Skip over malformed image records instead of failing
    #[arg(short = 'T', long)]
    tolerant: bool,
    /// Treat files no decoder recognizes as raw images
    #[arg(short = 'R', long)]
    allow_raw: bool,
    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'D', long)]
    foreground: bool,
}

#[derive(Args)]
struct InfoArgs {
    image: PathBuf,
    /// Treat files no decoder recognizes as raw images
    #[arg(short = 'R', long)]
    allow_raw: bool,
}

#[derive(Args)]
struct ChangesArgs {
    image: PathBuf,
    /// Change file (default: <image>.cf)
    #[arg(short = 'c', long)]
    change_file: Option<PathBuf>,
    /// Treat files no decoder recognizes as raw images
    #[arg(short = 'R', long)]
    allow_raw: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let result = match cli.command {
        Command::Serve(args) => cmd_serve(args),
        Command::Info(args) => cmd_info(args),
        Command::Changes(args) => cmd_changes(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Pass the host error number through as the exit code where one exists.
fn exit_code(err: &ImageError) -> u8 {
    let errno = match err {
        ImageError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        ImageError::NotPresent | ImageError::OutOfRange => libc::ENXIO,
        ImageError::BadRecord => libc::ESRCH,
        ImageError::Unsupported => libc::ENODEV,
        ImageError::NotWritable => libc::EROFS,
        ImageError::OutOfMemory => libc::ENOMEM,
        ImageError::Invalid => libc::EINVAL,
    };
    errno.clamp(1, u8::MAX as i32) as u8
}

const RUNDIR: &str = "/var/run";

fn create_pid_file(device: &Path) -> Option<PathBuf> {
    let device_name = device.file_name()?.to_string_lossy().into_owned();
    let path = PathBuf::from(format!("{RUNDIR}/snapimage.{device_name}.pid"));
    match std::fs::write(&path, format!("{}\n", std::process::id())) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("cannot write pid file {}: {e}", path.display());
            None
        }
    }
}

fn cmd_serve(args: ServeArgs) -> Result<(), ImageError> {
    let mode = if args.read_only {
        OpenMode::ReadOnly
    } else {
        OpenMode::ReadWrite
    };
    let mut image = Image::open(&args.image, args.change_file.as_deref(), mode, args.allow_raw)?;
    if args.tolerant {
        image.set_tolerant();
    }
    info!("preparing {} ({})", args.image.display(), image.type_name());
    image.verify()?;

    if !args.foreground {
        info!("daemonizing; log output stays on stderr");
        daemon(false, true)
            .map_err(|errno| ImageError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
    }

    nbd::install_signal_handlers()?;
    let conn = NbdConnection::connect(
        &args.device,
        image.blocksize()?,
        image.blockcount()?,
        args.timeout,
    )?;
    let pid_file = create_pid_file(&args.device);

    if let Some(mountpoint) = &args.mount {
        match nbd::spawn_mount(&args.device, mountpoint, &args.fstype, args.read_only) {
            // The failure is not fatal; someone else can try the mount.
            Err(e) => warn!("cannot fork to mount: {e}"),
            Ok(pid) => info!("mounting {} as pid {pid}", mountpoint.display()),
        }
        info!("mount {} is ready", mountpoint.display());
    } else {
        info!(
            "device {} is ready; disconnect with `nbd-client -d {}` when finished",
            args.device.display(),
            args.device.display()
        );
    }

    let socket = conn.socket.try_clone()?;
    let result = RequestLoop::new(&mut image, socket, args.mount.clone())?.run();

    conn.disconnect();
    if let Some(path) = pid_file {
        let _ = std::fs::remove_file(path);
    }
    // Flush any change-file state; harmless if nothing was written.
    let _ = image.sync();
    result
}

fn cmd_info(args: InfoArgs) -> Result<(), ImageError> {
    let mut image = Image::open(&args.image, None, OpenMode::ReadOnly, args.allow_raw)?;
    image.verify()?;
    println!("{}: {}", args.image.display(), image.type_name());
    match &image {
        Image::NtfsClone(img) => {
            let header = img.header().ok_or(ImageError::Invalid)?;
            println!("  version:      {}.{}", header.major_ver(), header.minor_ver());
            println!("  cluster size: {}", header.cluster_size());
            println!("  device size:  {}", header.device_size());
            println!(
                "  clusters:     {} ({} in use)",
                header.nr_clusters(),
                header.inuse()
            );
        }
        Image::Partclone(img) => {
            println!("  version:      {}", img.version_str());
            println!("  filesystem:   {}", img.fs_tag());
            println!("  device size:  {}", img.device_size());
            println!("  used blocks:  {}", img.usedblocks());
        }
        Image::Raw(_) => {}
    }
    println!("  blocksize:    {}", image.blocksize()?);
    println!("  blockcount:   {}", image.blockcount()?);
    Ok(())
}

fn cmd_changes(args: ChangesArgs) -> Result<(), ImageError> {
    let mut image = Image::open(&args.image, None, OpenMode::ReadOnly, args.allow_raw)?;
    image.verify()?;
    let blocksize = image.blocksize()?;
    let blockcount = image.blockcount()?;

    let cf_path = args
        .change_file
        .unwrap_or_else(|| default_cf_path(&args.image));
    let mut cf = ChangeFile::open(&cf_path, blocksize, blockcount)?;
    cf.verify()?;
    let total_blocks = cf.header().total_blocks();
    let used_blocks = cf.header().used_blocks();
    println!(
        "{}: {used_blocks} of {total_blocks} blocks overridden{}",
        cf_path.display(),
        if cf.header().is_dirty() { " (dirty)" } else { "" }
    );

    let mut buf = vec![0u8; blocksize as usize];
    let mut found = 0u64;
    let mut invalid = 0u64;
    for block in 0..total_blocks {
        let offset = cf.record_offset(block);
        if offset == 0 {
            continue;
        }
        found += 1;
        let ok = cf.verify_record(block, &mut buf).is_ok();
        if !ok {
            invalid += 1;
        }
        println!("{block}: offset {offset:#018x}: {}", if ok { "ok" } else { "INVALID" });
    }
    if found != used_blocks {
        warn!("map holds {found} records but the header counts {used_blocks}");
    }
    if invalid > 0 {
        return Err(ImageError::BadRecord);
    }
    Ok(())
}
