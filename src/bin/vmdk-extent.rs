//! vmdk-extent CLI
//!
//! Inspect, verify or create a single extent.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};
use vmdk_extent::{DiskExtent, Extent, ExtentConfig, ExtentInfo, ExtentKind, Result, VmdkError};

/// vmdk-extent
#[derive(Parser, Debug)]
#[command(name = "vmdk-extent")]
#[command(about = "Inspect and create VMDK extents")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print header and allocation statistics
    Inspect {
        /// Extent file
        path: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Decode every allocated grain and report corrupt ones
    Verify {
        /// Extent file
        path: PathBuf,
    },

    /// Create an empty extent
    Create {
        /// Extent file
        path: PathBuf,

        /// Capacity in 512-byte sectors
        #[arg(short, long)]
        capacity: u64,

        /// Create a stream-optimized extent instead of a sparse one
        #[arg(long)]
        stream_optimized: bool,

        /// Grain size in sectors
        #[arg(short, long, default_value = "128")]
        grain_size: u64,

        /// Skip the redundant grain directory
        #[arg(long)]
        no_redundant: bool,
    },
}

/// `inspect` output for extents without a grain index
#[derive(Serialize)]
struct FlatInfo {
    kind: ExtentKind,
    capacity_bytes: u64,
}

fn main() -> ExitCode {
    // Logs go to stderr so `inspect --json` stays parseable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vmdk_extent=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Commands::Inspect { path, json } => inspect(path, json),
        Commands::Verify { path } => verify(path),
        Commands::Create {
            path,
            capacity,
            stream_optimized,
            grain_size,
            no_redundant,
        } => create(path, capacity, stream_optimized, grain_size, !no_redundant),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn inspect(path: PathBuf, json: bool) -> Result<ExitCode> {
    let mut extent = Extent::open(&path)?;
    let kind = extent.kind();
    let capacity = extent.capacity();

    match extent.as_sparse_mut() {
        Some(sparse) => {
            let info = sparse.info();
            if json {
                print_json(&info)?;
            } else {
                print_info(&info);
            }
        }
        None if json => print_json(&FlatInfo {
            kind,
            capacity_bytes: capacity,
        })?,
        None => {
            println!("kind:            {:?}", kind);
            println!("capacity:        {} bytes", capacity);
        }
    }
    extent.close()?;
    Ok(ExitCode::SUCCESS)
}

fn verify(path: PathBuf) -> Result<ExitCode> {
    let mut extent = Extent::open(&path)?;
    let Some(sparse) = extent.as_sparse_mut() else {
        println!("{:?}: flat extent, nothing to verify", path);
        return Ok(ExitCode::SUCCESS);
    };

    let report = sparse.verify()?;
    for bad in &report.corrupt {
        println!("corrupt grain lba={} sector={}: {}", bad.lba, bad.sector, bad.reason);
    }
    println!(
        "{} grains checked, {} corrupt",
        report.grains_checked,
        report.corrupt.len()
    );
    extent.close()?;
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn create(
    path: PathBuf,
    capacity: u64,
    stream_optimized: bool,
    grain_size: u64,
    redundant: bool,
) -> Result<ExitCode> {
    let config = ExtentConfig::builder()
        .grain_size(grain_size)
        .redundant(redundant)
        .build();
    let bytes = capacity
        .checked_mul(512)
        .ok_or_else(|| VmdkError::Config(format!("capacity {} too large", capacity)))?;

    let extent = if stream_optimized {
        Extent::create_stream_optimized(&path, bytes, config)?
    } else {
        Extent::create_sparse(&path, bytes, &config)?
    };
    extent.close()?;
    println!("created {:?} ({} sectors)", path, capacity);
    Ok(ExitCode::SUCCESS)
}

fn print_info(info: &ExtentInfo) {
    let header = &info.header;
    println!("path:            {:?}", info.path);
    println!("type:            {}", info.create_type.as_str());
    println!("capacity:        {} sectors ({} bytes)", header.capacity, info.capacity_bytes);
    println!("version:         {}", header.version);
    println!("flags:           0x{:08x}", header.flags);
    println!("grain size:      {} sectors", header.grain_size);
    println!("GTEs per GT:     {}", header.num_gtes_per_gt);
    println!("gd offset:       {}", header.gd_offset);
    println!("rgd offset:      {}", header.rgd_offset);
    println!("overhead:        {} sectors", header.over_head);
    println!("compression:     {:?}", header.compress_algorithm);
    println!(
        "grain tables:    {} allocated of {}",
        info.allocated_tables, info.table_count
    );
    println!(
        "grains:          {} ({} bytes)",
        info.allocated_grains, info.allocated_bytes
    );
    if let Some(cid) = &info.content_id {
        println!("content id:      {}", cid);
    }
    if info.recovery.repaired_tables > 0 {
        println!(
            "recovered:       {} tables, {} entries from the redundant copy",
            info.recovery.repaired_tables, info.recovery.repaired_entries
        );
    }
    if let Some(scan) = &info.scan {
        println!(
            "rebuilt by scan: {} grains, {} skipped",
            scan.grains, scan.skipped
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{}", text);
    Ok(())
}
