//! Serve heap sessions to a device, or replay allocation traces locally.
//!
//! ```bash
//! # Serve sessions over a serial device until interrupted
//! offload-heap serve --device /dev/ttyUSB0 --policy best-fit --repeat
//!
//! # Replay a trace through an in-process session
//! offload-heap replay short.rep --policy segregated-fit -vv
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use offload_heap::{
    trace::{self, Trace},
    Client, ClientConfig, Codec, Encoding, Endian, EngineConfig, FitPolicy, HostSession,
    Loopback, Lookup, SimulatedRegion, Stream,
};
use std::{fs, path::PathBuf};

#[derive(Parser)]
#[command(name = "offload-heap", about = "Host-side heap bookkeeping for devices", version)]
struct Cli {
    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SessionArgs {
    /// Fit policy: first-fit, best-fit, segregated-fit.
    #[arg(short, long, default_value = "first-fit")]
    policy: FitPolicy,

    /// Frame encoding: wide or packed.
    #[arg(short, long, default_value = "wide")]
    encoding: Encoding,

    /// Byte order of the link: little or big.
    #[arg(long, default_value = "little")]
    endian: Endian,

    /// Find blocks by walking the block list instead of the address index.
    #[arg(long)]
    linear_lookup: bool,
}

impl SessionArgs {
    fn codec(&self) -> Codec {
        Codec::new(self.encoding, self.endian)
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .policy(self.policy)
            .lookup(if self.linear_lookup {
                Lookup::Linear
            } else {
                Lookup::Index
            })
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve allocation sessions over a serial device file.
    Serve {
        /// Path to the serial device.
        #[arg(short, long, default_value = "/dev/ttyUSB0")]
        device: PathBuf,

        /// Start a new session whenever one ends.
        #[arg(long)]
        repeat: bool,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Replay an allocation trace through an in-process session.
    Replay {
        /// Path to the trace file.
        trace: PathBuf,

        /// Base address of the simulated device heap.
        #[arg(long, default_value_t = 0x2000_0000)]
        base: u32,

        /// Maximum size of the simulated device heap, in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        capacity: u32,

        /// Minimum number of bytes to grow the heap by.
        #[arg(long, default_value_t = 4096)]
        chunk_size: u32,

        #[command(flatten)]
        session: SessionArgs,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn serve(device: PathBuf, repeat: bool, args: SessionArgs) -> Result<()> {
    loop {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .with_context(|| format!("failed to open {}", device.display()))?;

        let mut session = HostSession::new(args.codec(), args.engine_config());
        log::info!(
            "serving {} with {} frames and {}",
            device.display(),
            args.codec(),
            args.policy
        );
        let summary = session
            .serve(Stream::new(file))
            .context("session failed")?;
        println!("{summary}");

        if !repeat {
            return Ok(());
        }
    }
}

fn replay(
    path: PathBuf,
    base: u32,
    capacity: u32,
    chunk_size: u32,
    args: SessionArgs,
) -> Result<()> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let trace: Trace = text
        .parse()
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let config = ClientConfig::default()
        .codec(args.codec())
        .chunk_size(chunk_size);
    let session = HostSession::new(config.codec, args.engine_config());
    let mut client = Client::new(
        Loopback::new(session)?,
        SimulatedRegion::new(base, capacity),
        config,
    );
    client.init()?;

    let report = trace::replay(&mut client, &trace)
        .with_context(|| format!("replay of {} failed", path.display()))?;
    client.finish()?;

    println!("{}: {report}", path.display());
    println!("{}", client.transport().session().summary());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Serve {
            device,
            repeat,
            session,
        } => serve(device, repeat, session),
        Command::Replay {
            trace,
            base,
            capacity,
            chunk_size,
            session,
        } => replay(trace, base, capacity, chunk_size, session),
    }
}
