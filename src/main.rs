use clap::{Parser, Subcommand};
use log::error;
use prettytable::{Table, row};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pagefile::{
    BufferConfig, FileResult, NextFree, PAGE_SIZE, PagedFileManager, ReplacementAlgorithm,
};

#[derive(Parser, Debug)]
#[command(name = "pagefile", about = "Create and inspect paged database files")]
struct Args {
    #[arg(long, value_name = "FILE", help = "JSON buffer pool configuration")]
    config: Option<PathBuf>,

    #[arg(long, help = "Buffer pool capacity in pages")]
    capacity: Option<usize>,

    #[arg(long, help = "Replacement algorithm: lru, mru, fifo or clock")]
    algorithm: Option<ReplacementAlgorithm>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a file of 2^SIZE_EXPONENT bytes with every page free
    Create {
        path: PathBuf,
        #[arg(short, long, default_value_t = 16)]
        size_exponent: u32,
    },
    /// Show the file header and free list
    Inspect { path: PathBuf },
    /// Show the header of every page
    Pages { path: PathBuf },
    /// Delete a file
    Destroy { path: PathBuf },
}

fn buffer_config(args: &Args) -> FileResult<BufferConfig> {
    let mut config = match &args.config {
        Some(path) => BufferConfig::load(path)?,
        None => BufferConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(algorithm) = args.algorithm {
        config.algorithm = algorithm;
    }
    Ok(config)
}

fn inspect(pfm: &mut PagedFileManager, path: &Path) -> FileResult<()> {
    let mut handle = pfm.open(path)?;
    let free = handle.free_pages(pfm.buffer_manager_mut())?;
    let header = *handle.header();

    let link = |page: Option<usize>| page.map_or("-".to_string(), |id| id.to_string());

    let mut table = Table::new();
    table.set_titles(row!["Field", "Value"]);
    table.add_row(row!["file size", (header.num_pages + 1) * PAGE_SIZE]);
    table.add_row(row!["num pages", header.num_pages]);
    table.add_row(row!["first free", link(header.first_free)]);
    table.add_row(row!["free slot page", link(header.free_slot_page)]);
    table.add_row(row!["free pages", free.len()]);
    table.add_row(row!["used pages", header.num_pages - free.len()]);
    table.printstd();

    pfm.close_file(&mut handle)
}

fn pages(pfm: &mut PagedFileManager, path: &Path) -> FileResult<()> {
    let mut handle = pfm.open(path)?;

    let mut table = Table::new();
    table.set_titles(row!["Page", "State", "Next free", "Full", "Slots", "Free bytes"]);
    for page_id in 0..handle.num_pages() {
        let header = handle.page_header(pfm.buffer_manager_mut(), page_id)?;
        let (state, next) = match header.next_free {
            NextFree::Used => ("used", "-".to_string()),
            NextFree::End => ("free", "end".to_string()),
            NextFree::Page(next) => ("free", next.to_string()),
        };
        table.add_row(row![
            header.page_id,
            state,
            next,
            header.is_full,
            header.slot_num,
            header.free_cnt
        ]);
    }
    table.printstd();

    pfm.close_file(&mut handle)
}

fn run(args: Args) -> FileResult<()> {
    let mut pfm = PagedFileManager::new(buffer_config(&args)?)?;

    match args.command {
        Command::Create {
            path,
            size_exponent,
        } => {
            pfm.create_file(&path, size_exponent)?;
            println!("Created {} ({} bytes)", path.display(), 1u64 << size_exponent);
            Ok(())
        }
        Command::Inspect { path } => inspect(&mut pfm, &path),
        Command::Pages { path } => pages(&mut pfm, &path),
        Command::Destroy { path } => pfm.destroy_file(&path),
    }
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("pagefile: {}", e);
            ExitCode::FAILURE
        }
    }
}
