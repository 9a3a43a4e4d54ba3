//! SnapSync - LAN file transfer with resume and integrity verification

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use snapsync::errors::{self, ErrorKind};
use snapsync::logger::{Logger, NoopLogger, TextLogger};
use snapsync::receiver::{ReceiverOptions, StopListening};
use snapsync::sender::SenderOptions;
use snapsync::{buildinfo, discovery, receiver, sender};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "snapsync", version, about = "SnapSync - LAN file transfer with resume and integrity verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file over TCP
    Send {
        /// Source file path
        path: PathBuf,

        /// Receiver peer id or host:port
        #[arg(long)]
        to: String,

        /// Override transfer filename
        #[arg(long)]
        name: Option<String>,

        /// Session id for resumable retries (derived from the source by default)
        #[arg(long)]
        session: Option<String>,

        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 2)]
        timeout: u64,

        /// Disable resume
        #[arg(long)]
        no_resume: bool,

        /// Show a progress bar
        #[arg(short, long)]
        progress: bool,

        /// Append transfer events to a log file
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Receive a file over TCP
    Recv {
        /// Listen address (host:port)
        #[arg(long)]
        listen: String,

        /// Output directory
        #[arg(long)]
        out: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        overwrite: bool,

        /// Automatically accept the incoming transfer
        #[arg(long)]
        accept: bool,

        /// Advertised discovery name (hostname by default)
        #[arg(long)]
        name: Option<String>,

        /// Disable mDNS advertisement
        #[arg(long)]
        no_discovery: bool,

        /// Disable resume
        #[arg(long)]
        no_resume: bool,

        /// Keep partial files on failure
        #[arg(long)]
        keep_partial: bool,

        /// Force restart when resume session mismatches
        #[arg(long)]
        force_restart: bool,

        /// Break an existing lock file before receiving
        #[arg(long)]
        break_lock: bool,

        /// Show a progress bar
        #[arg(short, long)]
        progress: bool,

        /// Append transfer events to a log file
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// List discovered peers
    List {
        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 2)]
        timeout: u64,

        /// Print peers as NDJSON
        #[arg(long)]
        json: bool,
    },

    /// Print version information
    Version,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(errors::exit_code(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Send {
            path,
            to,
            name,
            session,
            timeout,
            no_resume,
            progress,
            log,
        } => run_send(path, to, name, session, timeout, no_resume, progress, log),
        Command::Recv {
            listen,
            out,
            overwrite,
            accept,
            name,
            no_discovery,
            no_resume,
            keep_partial,
            force_restart,
            break_lock,
            progress,
            log,
        } => run_recv(RecvArgs {
            listen,
            out,
            overwrite,
            accept,
            name,
            no_discovery,
            no_resume,
            keep_partial,
            force_restart,
            break_lock,
            progress,
            log,
        }),
        Command::List { timeout, json } => run_list(timeout, json),
        Command::Version => {
            println!("{}", buildinfo::get());
            Ok(())
        }
    }
}

fn event_logger(path: Option<&PathBuf>) -> Result<Arc<dyn Logger>> {
    match path {
        Some(path) => Ok(Arc::new(
            TextLogger::new(path).with_context(|| format!("open log file {}", path.display()))?,
        )),
        None => Ok(Arc::new(NoopLogger)),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_send(
    path: PathBuf,
    to: String,
    name: Option<String>,
    session: Option<String>,
    timeout: u64,
    no_resume: bool,
    progress: bool,
    log: Option<PathBuf>,
) -> Result<()> {
    // A bare peer id has no port separator; resolve it over mDNS.
    let address = if to.contains(':') {
        to
    } else {
        let peer = discovery::resolve_by_id(&to, Duration::from_secs(timeout))
            .context("discover peers")?
            .ok_or_else(|| {
                errors::tag(ErrorKind::Network, format!("peer id {to:?} not found"))
            })?;
        let host = peer.preferred_address().ok_or_else(|| {
            errors::tag(
                ErrorKind::Network,
                format!("peer {:?} has no usable address", peer.id),
            )
        })?;
        format!("{host}:{}", peer.port)
    };

    sender::send(SenderOptions {
        path,
        address,
        override_name: name,
        session_id: session,
        resume: !no_resume,
        progress,
        out: Box::new(std::io::stdout()),
        logger: event_logger(log.as_ref())?,
        chunk_transform: None,
    })
}

struct RecvArgs {
    listen: String,
    out: PathBuf,
    overwrite: bool,
    accept: bool,
    name: Option<String>,
    no_discovery: bool,
    no_resume: bool,
    keep_partial: bool,
    force_restart: bool,
    break_lock: bool,
    progress: bool,
    log: Option<PathBuf>,
}

fn run_recv(args: RecvArgs) -> Result<()> {
    let mut opts = ReceiverOptions {
        listen: args.listen,
        out_dir: args.out,
        overwrite: args.overwrite,
        auto_accept: args.accept,
        prompt: Some(Box::new(prompt_accept)),
        resume: !args.no_resume,
        keep_partial: args.keep_partial,
        force_restart: args.force_restart,
        break_lock: args.break_lock,
        progress: args.progress,
        out: Box::new(std::io::stdout()),
        logger: event_logger(args.log.as_ref())?,
        on_listening: None,
    };

    if !args.no_discovery {
        let peer_id = discovery::local_peer_id().context("load local peer id")?;
        let display = args.name.clone().or_else(hostname_string).unwrap_or_default();
        let instance = if display.is_empty() {
            "snapsync".to_string()
        } else {
            display.clone()
        };
        opts.on_listening = Some(Box::new(move |addr| {
            let mut advertiser =
                discovery::advertise(&instance, &peer_id, &display, addr.port())
                    .context("start discovery advertisement")?;
            Ok(Box::new(move || advertiser.stop()) as StopListening)
        }));
    }

    receiver::receive_once(opts)
}

fn hostname_string() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

fn prompt_accept(name: &str, size: u64, peer: &str) -> Result<bool> {
    print!("Accept file {name} ({size} bytes) from {peer}? [y/N] ");
    std::io::stdout()
        .flush()
        .context("write accept prompt")?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read accept prompt input")?;
    let value = line.trim().to_lowercase();
    Ok(value == "y" || value == "yes")
}

fn run_list(timeout: u64, json: bool) -> Result<()> {
    let mut peers =
        discovery::browse(Duration::from_secs(timeout)).context("browse peers")?;
    discovery::sort_by_freshness(&mut peers);
    if json {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for peer in &peers {
            serde_json::to_writer(&mut out, peer).context("encode peer output")?;
            writeln!(out).context("write peer output")?;
        }
        return Ok(());
    }
    println!(
        "{:<14} {:<16} {:<24} {:<6} AGE",
        "ID", "NAME", "ADDRESSES", "PORT"
    );
    for peer in &peers {
        let age = peer
            .age()
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<16} {:<24} {:<6} {}",
            peer.id,
            peer.name,
            peer.addresses.join(", "),
            peer.port,
            age
        );
    }
    Ok(())
}
