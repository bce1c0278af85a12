//! nvmfs image tool
//!
//! Formats and inspects file-backed flash images and runs the story and
//! counter demonstration against them.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nvmfs::nvm::FileDevice;
use nvmfs::{Filesystem, FsBuilder, FsConfig, FsError, OpenFlags, Whence};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::info;

const STORY_PATH: &str = "fs/story.txt";
const COUNTER_PATH: &str = "fs/counter.txt";

#[derive(Parser, Debug)]
#[command(name = "nvmfs")]
#[command(about = "Inspect and modify nvmfs flash images", version)]
struct Args {
    /// Path to the flash image
    #[arg(short, long, default_value = "flash.img")]
    image: PathBuf,

    /// TOML configuration file (geometry, GC and cache settings)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Page size in bytes (overrides the configuration)
    #[arg(long)]
    page_size: Option<u32>,

    /// Pages per erase block (overrides the configuration)
    #[arg(long)]
    pages_per_block: Option<u32>,

    /// Number of erase blocks (overrides the configuration)
    #[arg(long)]
    block_count: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create (or wipe) the image and format it
    Format,
    /// List objects
    Ls,
    /// Print an object to stdout
    Cat { name: String },
    /// Store an object, reading from a file or stdin
    Put {
        name: String,
        /// Source file (stdin if omitted)
        #[arg(short, long)]
        from: Option<PathBuf>,
    },
    /// Remove an object
    Rm { name: String },
    /// Run garbage collection until no stale pages remain
    Gc,
    /// Show usage and wear statistics
    Stats,
    /// Write the story file and bump the persistent counter
    Demo,
}

fn builder(args: &Args) -> anyhow::Result<FsBuilder> {
    let config = match &args.config {
        Some(path) => FsConfig::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => FsConfig::default(),
    };

    let mut builder = FsBuilder::with_config(config);
    if let Some(page_size) = args.page_size {
        builder = builder.page_size(page_size);
    }
    if let Some(pages_per_block) = args.pages_per_block {
        builder = builder.pages_per_block(pages_per_block);
    }
    if let Some(block_count) = args.block_count {
        builder = builder.block_count(block_count);
    }
    Ok(builder)
}

fn mount(args: &Args) -> anyhow::Result<Filesystem<FileDevice>> {
    builder(args)?
        .mount_file(&args.image)
        .with_context(|| format!("mounting {}", args.image.display()))
}

/// Scenario A: write 16 of the 17 story bytes and read them back
fn demo_story(fs: &Filesystem<FileDevice>) -> anyhow::Result<()> {
    let story = b"The big bad wolf.";

    let mut file = fs.open(
        STORY_PATH,
        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READ_WRITE,
    )?;
    let written = file.write(&story[..16])?;
    file.close()?;

    let mut file = fs.open(STORY_PATH, OpenFlags::READ_WRITE)?;
    let mut buf = [0u8; 16];
    let read = file.read(&mut buf)?;
    file.close()?;

    println!(
        "{}: wrote {} bytes, read back {:?}",
        STORY_PATH,
        written,
        String::from_utf8_lossy(&buf[..read])
    );
    Ok(())
}

/// Scenario B: open-or-create the counter, print it and store value + 1
fn demo_counter(fs: &Filesystem<FileDevice>) -> anyhow::Result<()> {
    let mut file = match fs.open(COUNTER_PATH, OpenFlags::READ_WRITE) {
        Ok(file) => file,
        Err(FsError::NotFound(_)) => {
            let mut file = fs.open(
                COUNTER_PATH,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READ_WRITE,
            )?;
            file.write(b"0\0")?;
            file.seek(0, Whence::Set)?;
            file
        }
        Err(err) => return Err(err.into()),
    };

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    let value: u64 = text
        .trim_end_matches('\0')
        .trim()
        .parse()
        .with_context(|| format!("{} holds {:?}", COUNTER_PATH, text))?;

    let next = format!("{}\0", value + 1);
    file.seek(0, Whence::Set)?;
    file.write(next.as_bytes())?;
    file.truncate(next.len() as u64)?;
    file.close()?;

    println!("{}: counter {} -> {}", COUNTER_PATH, value, value + 1);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Command::Format => {
            let fs = builder(&args)?.format_file(&args.image)?;
            let geometry = fs.geometry();
            println!(
                "Formatted {}: {} blocks x {} pages x {} bytes",
                args.image.display(),
                geometry.block_count,
                geometry.pages_per_block,
                geometry.page_size
            );
        }
        Command::Ls => {
            let fs = mount(&args)?;
            for object in fs.list() {
                println!(
                    "{:>8} {:>6} pages  {}",
                    object.size, object.pages, object.name
                );
            }
        }
        Command::Cat { name } => {
            let fs = mount(&args)?;
            let mut file = fs.open(name, OpenFlags::READ)?;
            let mut content = Vec::new();
            file.read_to_end(&mut content)?;
            std::io::stdout().write_all(&content)?;
        }
        Command::Put { name, from } => {
            let content = match from {
                Some(path) => std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut content = Vec::new();
                    std::io::stdin().read_to_end(&mut content)?;
                    content
                }
            };

            let fs = mount(&args)?;
            let mut file = fs.open(
                name,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )?;
            let written = file.write(&content)?;
            if written != content.len() {
                bail!("short write: {} of {} bytes", written, content.len());
            }
            file.close()?;
            info!("Stored {} ({} bytes)", name, written);
        }
        Command::Rm { name } => {
            let fs = mount(&args)?;
            fs.remove(name)?;
        }
        Command::Gc => {
            let fs = mount(&args)?;
            let report = fs.collect_garbage()?;
            println!(
                "Collected {} blocks: {} pages relocated, {} pages reclaimed",
                report.victims.len(),
                report.relocated,
                report.reclaimed
            );
        }
        Command::Stats => {
            let fs = mount(&args)?;
            let stats = fs.stats();
            println!("objects:      {}", stats.objects);
            println!("bytes stored: {}", stats.bytes_stored);
            println!(
                "pages:        {} free, {} used, {} stale, {} bad ({} reserved for GC)",
                stats.free_pages,
                stats.used_pages,
                stats.stale_pages,
                stats.bad_pages,
                stats.reserve_pages
            );
            println!(
                "erases:       {} total, {}..{} per block",
                stats.total_erases, stats.min_erase_count, stats.max_erase_count
            );
            println!("generation:   {}", stats.generation);
        }
        Command::Demo => {
            let fs = builder(&args)?
                .mount_or_format_file(&args.image)
                .with_context(|| format!("opening {}", args.image.display()))?;
            demo_story(&fs)?;
            demo_counter(&fs)?;
        }
    }

    Ok(())
}
