use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use jensen_core::transport::{NusbOpener, backend};
use jensen_core::{DeviceSession, DeviceTime, SessionConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "HiDock recorder management tool", long_about = None)]
struct Args {
    /// Vendor id override (hex)
    #[arg(long, value_parser = parse_hex16)]
    vid: Option<u16>,

    /// Product id override (hex)
    #[arg(long, value_parser = parse_hex16)]
    pid: Option<u16>,

    /// Path to a session config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drain stale device state before the first command
    #[arg(long)]
    force_reset: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show firmware version and serial number
    Info,
    /// Show or set the device clock
    Time {
        /// New time as YYYYMMDDHHmmss; omit to read
        stamp: Option<String>,
    },
    /// List recordings on the device
    Files,
    /// Show storage card capacity
    Storage,
    /// Download a recording to a local file
    Download {
        name: String,
        /// Destination path; defaults to the recording name
        dest: Option<PathBuf>,
    },
    /// Delete a recording
    Delete { name: String },
    /// Format the storage card, erasing all recordings
    Format {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn parse_hex16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(vid) = args.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.product_id = pid;
    }
    config.force_reset |= args.force_reset;

    let resolved = backend::resolve()?;
    match &resolved.library {
        Some(path) => info!(library = %path.display(), "USB backend resolved"),
        None => info!("USB backend resolved via device enumeration"),
    }

    let session = DeviceSession::new(config);
    let report = session.connect(&NusbOpener)?;
    if report.substituted {
        warn!(
            requested = %format!("{:04X}:{:04X}", report.requested.0, report.requested.1),
            connected = %format!("{:04X}:{:04X}", report.connected.0, report.connected.1),
            "Configured device not found, connected to another HiDock"
        );
    }

    let result = dispatch(&args.command, &session);
    session.disconnect();
    result
}

fn dispatch(command: &Command, session: &DeviceSession) -> anyhow::Result<()> {
    match command {
        Command::Info => {
            let info = session.device_info()?;
            println!("firmware: {}", info.firmware);
            println!("serial:   {}", info.serial);
        }
        Command::Time { stamp: None } => match session.device_time()? {
            Some(time) => println!("{time}"),
            None => println!("clock not set"),
        },
        Command::Time { stamp: Some(stamp) } => {
            session.set_device_time(DeviceTime::parse(stamp)?)?;
            println!("clock updated");
        }
        Command::Files => {
            let files = session.list_files()?;
            for file in &files {
                println!("{:>10}  {}", file.size, file.name);
            }
            println!("{} recordings", files.len());
        }
        Command::Storage => {
            let storage = session.storage_info()?;
            println!(
                "{} MiB free of {} MiB",
                storage.free_mib, storage.total_mib
            );
        }
        Command::Download { name, dest } => {
            let files = session.list_files()?;
            let entry = files
                .iter()
                .find(|f| f.name == *name)
                .with_context(|| format!("no recording named {name:?} on the device"))?;
            let dest = dest.clone().unwrap_or_else(|| PathBuf::from(name));
            let mut out = File::create(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
            let received = session.stream_file(name, entry.size, &mut |chunk| {
                out.write_all(chunk)
                    .map_err(|e| jensen_core::TransportError::from(e).into())
            })?;
            println!("wrote {received} bytes to {}", dest.display());
        }
        Command::Delete { name } => {
            session.delete_file(name)?;
            println!("deleted {name}");
        }
        Command::Format { yes } => {
            if !yes {
                bail!("refusing to format without --yes");
            }
            session.format_storage()?;
            println!("storage formatted");
        }
    }
    Ok(())
}
