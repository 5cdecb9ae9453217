use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pagesync::mmap::{Prot, VmArea};
use pagesync::{FileKind, FileOps, IoFlags, MemEngine, PageSyncConfig, StorageEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pagesync")]
#[command(about = "Primary cache and page cache synchronization", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a mapped file through fault-in, explicit write and write-back")]
    Demo {
        /// File size in bytes
        #[arg(long, default_value_t = 10_000)]
        size: usize,
    },
    #[command(about = "Print the effective configuration as YAML")]
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<PageSyncConfig> {
    match path {
        Some(path) => PageSyncConfig::from_file(path),
        None => Ok(PageSyncConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo { size } => demo(&config, size).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn demo(config: &PageSyncConfig, size: usize) -> Result<()> {
    if size == 0 {
        bail!("--size must be positive");
    }
    let engine = Arc::new(MemEngine::new());
    let ops = FileOps::new(engine.clone(), config);

    let ino = engine.create_file(MemEngine::ROOT_INO, "demo")?;
    let inode = ops.new_inode(ino, FileKind::Regular);
    let mut file = ops.open(inode.clone(), IoFlags::LARGEFILE)?;

    let pattern: Vec<u8> = (0..size).map(|i| b'a' + (i % 26) as u8).collect();
    ops.write(&mut file, &pattern).await?;
    info!(ino, size, "file populated through the primary cache");

    let page_size = config.page_size;
    let len = size.div_ceil(page_size) * page_size;
    let vma = VmArea {
        start: 0x7f00_0000_0000,
        len: len as u64,
        pgoff: 0,
        prot: Prot::READ | Prot::WRITE,
        shared: true,
    };
    ops.mmap(&file, &vma)?;

    let nr_pages = size.div_ceil(page_size) as u64;
    let mut pages = Vec::new();
    for index in 0..nr_pages {
        pages.push(ops.fault(&file, index).await?);
    }
    let tail = size - (nr_pages as usize - 1) * page_size;
    let last = pages
        .last()
        .context("no page was faulted")?
        .user_load(tail, page_size - tail)
        .await?;
    info!(
        pages = pages.len(),
        zeroed_tail = last.iter().filter(|b| **b == 0).count(),
        "pages faulted in"
    );

    ops.llseek(&mut file, SeekFrom::Start(0))?;
    ops.write(&mut file, b"hello").await?;
    let seen = pages[0].user_load(0, 5).await?;
    info!(mapped_view = %String::from_utf8_lossy(&seen), "explicit write propagated");

    pages[0].user_store(5, b", world").await?;
    let status = ops.fsync(&file, false).await;
    if status != 0 {
        bail!("fsync failed: {}", std::io::Error::from_raw_os_error(-status));
    }

    let mut head = [0u8; 12];
    ops.llseek(&mut file, SeekFrom::Start(0))?;
    ops.read(&mut file, &mut head).await?;
    info!(primary_cache = %String::from_utf8_lossy(&head), "mapped store written back");

    ops.release(file)?;
    let stats = engine.stats();
    println!("size:            {}", engine.size(ino));
    println!("resident pages:  {}", inode.mapping().nr_pages());
    println!("external reads:  {}", stats.external_reads);
    println!("bypass reads:    {}", stats.bypass_reads);
    println!("external writes: {}", stats.external_writes);
    println!("bypass writes:   {}", stats.bypass_writes);
    Ok(())
}
