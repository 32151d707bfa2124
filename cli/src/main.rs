// fat32mgr: inspect and maintain FAT32 volume images from the command line

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fat32mgr_core::{
    BlockDevice, CancelToken, ClusterAlignment, EngineConfig, FileDevice, FormatOptions, LoggingProgress,
};
use fat32mgr_filesystems::fat32::directory::join_path;
use fat32mgr_filesystems::{
    simulate_format, DefragStatus, DirEntry, EntryKind, EraseScope, MountOptions, SortOptions, Volume,
};
use log::{info, warn};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fat32mgr")]
#[command(about = "Format, inspect and maintain FAT32 volume images", long_about = None)]
struct Cli {
    /// Volume image or device node
    #[arg(long, global = true)]
    image: Option<PathBuf>,
    /// Bytes per sector of the image (defaults to the configured value)
    #[arg(long, global = true)]
    sector_size: Option<u32>,
    /// Configuration file (defaults to the user configuration directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output; repeat for debug messages
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show boot sector and allocation summary
    Info {
        #[arg(long)]
        json: bool,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Write a new, empty FAT32 volume
    Format {
        /// Image size such as 64M or 2G; required when the image does not exist yet
        #[arg(long, value_parser = parse_size)]
        size: Option<u64>,
        #[arg(short, long)]
        label: Option<String>,
        /// none, integral or power-of-two
        #[arg(long)]
        alignment: Option<ClusterAlignment>,
        /// Sectors per cluster
        #[arg(long)]
        spc: Option<u32>,
        /// Print the geometry without writing
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Check every cluster chain for faults
    Scan {
        #[arg(long)]
        json: bool,
    },
    /// Make fragmented files contiguous
    Defrag {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(long)]
        preview: bool,
    },
    /// Overwrite free clusters; with --dir only those left by deleted entries there
    Erase {
        /// Byte written over free clusters, decimal or 0x-prefixed
        #[arg(long, value_parser = parse_byte)]
        filler: Option<u8>,
        #[arg(long)]
        dir: Option<String>,
        #[arg(short, long, requires = "dir")]
        recursive: bool,
        /// Afterwards drop the deleted records from the directory tables
        #[arg(long, requires = "dir")]
        purge: bool,
    },
    /// Sort directory entries
    Sort {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(short = 'i', long)]
        ignore_case: bool,
        #[arg(long)]
        preview: bool,
    },
    /// Set the volume label
    Label { text: String },
    /// Create a directory
    Mkdir { path: String },
    /// Copy a host file into the volume
    Put { source: PathBuf, dest: String },
    /// Copy a file out of the volume (to stdout without a destination)
    Get { source: String, dest: Option<PathBuf> },
    /// Delete a file or empty directory
    Rm { path: String },
    /// Move an entry into another directory
    Mv { path: String, dest_dir: String },
    /// Rename an entry in place
    Rename { path: String, new_name: String },
    /// List deleted entries of a directory
    Deleted {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Hex dump of one sector or cluster
    Dump {
        #[arg(long, conflicts_with = "cluster", required_unless_present = "cluster")]
        sector: Option<u64>,
        #[arg(long)]
        cluster: Option<u32>,
    },
    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().map_err(|_| format!("invalid size: {}", text))?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(format!("unknown size unit: {}", unit)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", text))
}

fn parse_byte(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex_digits) => u8::from_str_radix(hex_digits, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("not a byte value: {}", text))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Run `job` on the blocking pool; Ctrl-C cancels it at its next safe point
async fn run_cancellable<T, F>(job: F) -> anyhow::Result<T>
where
    F: FnOnce(CancelToken) -> T + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancelToken::new();
    let worker = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || job(worker));
    tokio::select! {
        result = &mut task => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping at the next safe point");
            cancel.cancel();
            Ok(task.await?)
        }
    }
}

struct Session {
    image: Option<PathBuf>,
    sector_size: usize,
    config: EngineConfig,
}

impl Session {
    fn image(&self) -> anyhow::Result<&Path> {
        self.image.as_deref().context("this command needs --image")
    }

    fn open(&self, writable: bool) -> anyhow::Result<Volume<FileDevice>> {
        let image = self.image()?;
        let device = if writable {
            FileDevice::open(image, self.sector_size)
        } else {
            FileDevice::open_read_only(image, self.sector_size)
        }
        .with_context(|| format!("cannot open {}", image.display()))?;
        Volume::mount_with(device, MountOptions::from(&self.config))
            .with_context(|| format!("cannot mount {}", image.display()))
    }
}

fn format_time(entry: &DirEntry) -> String {
    entry
        .modified
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".repeat(19))
}

fn print_entry(path: &str, entry: &DirEntry) {
    let kind = match entry.kind {
        EntryKind::VolumeLabel => "label",
        EntryKind::SpecialDirectory | EntryKind::Directory => "dir",
        EntryKind::File => "file",
    };
    println!("{:<5} {:>12} {} {}", kind, entry.size, format_time(entry), path);
}

fn list<D: BlockDevice>(volume: &mut Volume<D>, path: &str, recursive: bool) -> anyhow::Result<()> {
    let entries = volume.list_directory(path)?;
    for entry in entries.iter().filter(|e| e.kind != EntryKind::SpecialDirectory) {
        print_entry(&join_path(path, &entry.name), entry);
    }
    if recursive {
        for entry in entries.iter().filter(|e| e.is_directory()) {
            list(volume, &join_path(path, &entry.name), true)?;
        }
    }
    Ok(())
}

fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            format!("{:08x}  {:<47}  {}", row * 16, bytes.join(" "), ascii)
        })
        .collect()
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    println!("{}", prompt);
    println!("Type 'yes' to continue: ");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().or_else(EngineConfig::default_path);
    let config = match &config_path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("cannot load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let session = Session {
        image: cli.image.clone(),
        sector_size: cli.sector_size.unwrap_or(config.format.bytes_per_sector) as usize,
        config,
    };

    match cli.command {
        Commands::Info { json } => {
            let volume = session.open(false)?;
            let props = volume.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&props)?);
            } else {
                println!("Label:               {}", props.label);
                println!("Serial:              {}", props.serial);
                println!("Formatter:           {}", props.formatter_name);
                println!("Media descriptor:    0x{:02X}", props.media_descriptor);
                println!("Bytes per sector:    {}", props.bytes_per_sector);
                println!("Sectors per cluster: {}", props.sectors_per_cluster);
                println!("Total sectors:       {}", props.total_sectors);
                println!("Reserved sectors:    {}", props.reserved_sectors);
                println!("FATs:                {} x {} sectors", props.num_fats, props.sectors_per_fat);
                println!("Root cluster:        {}", props.root_cluster);
                println!("Clusters:            {} ({} free)", props.num_clusters, props.free_clusters);
                for divergence in &props.fat_divergences {
                    println!(
                        "  FAT copy {} differs from copy 0 in {} entries, first at cluster {}",
                        divergence.fat_index, divergence.differing_entries, divergence.first_cluster
                    );
                }
            }
        }
        Commands::Ls { path, recursive } => {
            let mut volume = session.open(false)?;
            list(&mut volume, &path, recursive)?;
        }
        Commands::Format {
            size,
            label,
            alignment,
            spc,
            dry_run,
            yes,
        } => {
            let image = session.image()?.to_path_buf();
            let mut params = session.config.format.clone();
            params.bytes_per_sector = session.sector_size as u32;
            if let Some(alignment) = alignment {
                params.cluster_alignment = alignment;
            }
            let options = FormatOptions {
                label,
                sectors_per_cluster: spc,
                ..FormatOptions::default()
            };

            let num_sectors = match size {
                Some(bytes) => bytes / session.sector_size as u64,
                None => FileDevice::open_read_only(&image, session.sector_size)
                    .with_context(|| format!("{} does not exist; pass --size", image.display()))?
                    .num_sectors(),
            };
            let report = simulate_format(num_sectors, &params, &options)?;
            let geometry = &report.geometry;
            println!("Image:               {}", image.display());
            println!("Total sectors:       {}", geometry.total_sectors);
            println!("Sectors per cluster: {}", geometry.sectors_per_cluster);
            println!("Reserved sectors:    {}", geometry.reserved_sectors);
            println!("Sectors per FAT:     {}", geometry.sectors_per_fat);
            println!("Clusters:            {}", report.num_clusters);
            println!("Usable bytes:        {}", report.usable_bytes);
            for warning in &report.warnings {
                println!("  Warning: {}", warning);
            }
            if dry_run {
                return Ok(());
            }
            if image.exists() && !yes && !confirm(&format!("WARNING: This will ERASE ALL DATA in {}!", image.display()))? {
                println!("Format cancelled.");
                return Ok(());
            }

            let device = match size {
                Some(_) => FileDevice::create(&image, session.sector_size, num_sectors),
                None => FileDevice::open(&image, session.sector_size),
            }
            .with_context(|| format!("cannot open {}", image.display()))?;
            let volume = run_cancellable(move |cancel| {
                Volume::format(device, &params, &options, &cancel, Arc::new(LoggingProgress))
            })
            .await??;
            println!("Formatted {} as FAT32 \"{}\"", image.display(), volume.info().label);
            volume.unmount()?;
        }
        Commands::Scan { json } => {
            let mut volume = session.open(false)?;
            let report = run_cancellable(move |cancel| volume.scan_report(&cancel, Arc::new(LoggingProgress)))
                .await??;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for finding in &report.invalid_clusters {
                    let index = finding
                        .fat_index
                        .map_or_else(|| "entry".to_string(), |i| format!("FAT[{}]", i));
                    println!("{}: {} = 0x{:08X}: {}", finding.pathname, index, finding.value, finding.fault);
                }
                for mismatch in &report.length_mismatches {
                    println!(
                        "{}: {} bytes need {} clusters, chain has {}",
                        mismatch.pathname, mismatch.size, mismatch.expected_clusters, mismatch.actual_clusters
                    );
                }
                for dir in &report.unreadable_directories {
                    println!("{}: unreadable directory: {}", dir.pathname, dir.reason);
                }
                for divergence in &report.fat_divergences {
                    println!(
                        "FAT copy {} differs in {} entries (first at cluster {})",
                        divergence.fat_index, divergence.differing_entries, divergence.first_cluster
                    );
                }
                println!("{} clusters checked", report.clusters_checked);
            }
            if !report.is_clean() {
                bail!("volume has integrity problems");
            }
        }
        Commands::Defrag {
            path,
            recursive,
            preview,
        } => {
            let mut volume = session.open(!preview)?;
            let (report, volume) = run_cancellable(move |cancel| {
                let report = if preview {
                    volume.defragment_preview(&path, recursive)
                } else {
                    volume.defragment(&path, recursive, &cancel, Arc::new(LoggingProgress))
                };
                (report, volume)
            })
            .await?;
            let report = report?;
            for file in &report.files {
                match &file.status {
                    DefragStatus::NotFragmented => info!("{}: not fragmented", file.path),
                    DefragStatus::Defragmented { from, to } => {
                        println!("{}: {} clusters, {} -> {}", file.path, file.clusters, from, to)
                    }
                    DefragStatus::NotEnoughSpace => println!("{}: skipped, not enough contiguous space", file.path),
                    DefragStatus::ChainError(reason) => println!("{}: skipped, {}", file.path, reason),
                }
            }
            println!(
                "{} of {} files {}{}",
                report.defragmented(),
                report.files.len(),
                if preview { "would be moved" } else { "moved" },
                if report.cancelled { " (cancelled)" } else { "" }
            );
            if !preview {
                volume.unmount()?;
            }
        }
        Commands::Erase {
            filler,
            dir,
            recursive,
            purge,
        } => {
            let filler = filler.unwrap_or(session.config.filler_byte);
            let scope = match dir.clone() {
                Some(path) => EraseScope::Directory { path, recursive },
                None => EraseScope::Volume,
            };
            let mut volume = session.open(true)?;
            let (report, mut volume) = run_cancellable(move |cancel| {
                let report = volume.erase_unused(&scope, filler, &cancel, Arc::new(LoggingProgress));
                (report, volume)
            })
            .await?;
            let report = report?;
            println!(
                "Erased {} clusters{}",
                report.clusters_erased,
                if report.cancelled { " (cancelled)" } else { "" }
            );
            if let (true, Some(path)) = (purge && !report.cancelled, dir) {
                let removed = volume.erase_deleted_entries(&path, recursive)?;
                println!("Removed {} deleted records", removed);
            }
            volume.unmount()?;
        }
        Commands::Sort {
            path,
            recursive,
            ignore_case,
            preview,
        } => {
            let options = SortOptions {
                recursive,
                ignore_case: ignore_case || session.config.sort_ignore_case,
                preview,
            };
            let mut volume = session.open(!preview)?;
            let (report, volume) = run_cancellable(move |cancel| {
                let report = volume.sort(&path, &options, &cancel);
                (report, volume)
            })
            .await?;
            let report = report?;
            for dir in report.directories.iter().filter(|d| d.changed) {
                println!("{}", dir.path);
                if preview {
                    for name in &dir.order {
                        println!("  {}", name);
                    }
                }
            }
            println!(
                "{} of {} directories {}",
                report.changed(),
                report.directories.len(),
                if preview { "would change" } else { "sorted" }
            );
            if !preview {
                volume.unmount()?;
            }
        }
        Commands::Label { text } => {
            let mut volume = session.open(true)?;
            volume.set_label(&text, Some(chrono::Local::now().naive_local()))?;
            println!("Label set to \"{}\"", volume.info().label);
            volume.unmount()?;
        }
        Commands::Mkdir { path } => {
            let mut volume = session.open(true)?;
            volume.create_directory(&path)?;
            volume.unmount()?;
        }
        Commands::Put { source, dest } => {
            let data = std::fs::read(&source).with_context(|| format!("cannot read {}", source.display()))?;
            let mut volume = session.open(true)?;
            let into_dir = dest.ends_with('/') || volume.stat(&dest).map(|e| e.is_directory()).unwrap_or(false);
            let dest = if into_dir {
                let name = source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context("source has no usable file name")?;
                join_path(dest.trim_end_matches('/'), name)
            } else {
                dest
            };
            let entry = volume.create_file(&dest, &data)?;
            println!("{} ({} bytes, short name {})", dest, entry.size, entry.short_name);
            volume.unmount()?;
        }
        Commands::Get { source, dest } => {
            let mut volume = session.open(false)?;
            let data = volume.read_file(&source)?;
            match dest {
                Some(path) => std::fs::write(&path, &data).with_context(|| format!("cannot write {}", path.display()))?,
                None => io::stdout().lock().write_all(&data)?,
            }
        }
        Commands::Rm { path } => {
            let mut volume = session.open(true)?;
            volume.delete(&path)?;
            volume.unmount()?;
        }
        Commands::Mv { path, dest_dir } => {
            let mut volume = session.open(true)?;
            volume.move_entry(&path, &dest_dir)?;
            volume.unmount()?;
        }
        Commands::Rename { path, new_name } => {
            let mut volume = session.open(true)?;
            volume.rename(&path, &new_name)?;
            volume.unmount()?;
        }
        Commands::Deleted { path } => {
            let mut volume = session.open(false)?;
            for entry in volume.find_deleted_entries(&path)? {
                print_entry(&join_path(&path, &entry.name), &entry);
            }
        }
        Commands::Dump { sector, cluster } => {
            let mut volume = session.open(false)?;
            let data = match (sector, cluster) {
                (Some(sector), _) => volume.read_sector(sector)?,
                (None, Some(cluster)) => volume.read_cluster(cluster)?,
                (None, None) => bail!("pass --sector or --cluster"),
            };
            for line in hex_dump(&data) {
                println!("{}", line);
            }
        }
        Commands::Config { action } => {
            let path = config_path.context("no configuration directory on this platform; pass --config")?;
            match action {
                ConfigCommand::Show => {
                    println!("# {}", path.display());
                    println!("{}", serde_json::to_string_pretty(&session.config)?);
                }
                ConfigCommand::Init { force } => {
                    if path.exists() && !force {
                        bail!("{} already exists; use --force to overwrite", path.display());
                    }
                    EngineConfig::default().save(&path)?;
                    println!("Wrote {}", path.display());
                }
            }
        }
    }

    Ok(())
}
