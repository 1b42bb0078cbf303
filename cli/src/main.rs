use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use memmap2::Mmap;
use tracing::info;

use bindelta::{Mode, Parts, make_diff, patch};

const MAGIC: u32 = 0xB5D1;
const VERSION: u32 = 0x1000;

#[derive(Parser)]
#[command(name = "bindelta", about = "Produce and apply binary deltas")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Write a delta that rebuilds NEW from OLD
    Diff {
        old: PathBuf,
        new: PathBuf,
        delta: PathBuf,
        /// Match index to build over OLD
        #[arg(long, value_enum, default_value = "suffix")]
        mode: IndexArg,
        /// Emit literal-only instructions and drop the add stream
        #[arg(long)]
        no_add_block: bool,
    },
    /// Rebuild NEW from OLD and a delta
    Patch {
        old: PathBuf,
        delta: PathBuf,
        new: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum IndexArg {
    Suffix,
    Hash,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().cmd {
        Cmd::Diff {
            old,
            new,
            delta,
            mode,
            no_add_block,
        } => diff(&old, &new, &delta, mode, no_add_block),
        Cmd::Patch { old, delta, new } => apply(&old, &delta, &new),
    }
}

fn map_input(path: &Path) -> Result<Mmap> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    // Safety: mapped read-only; the inputs are not expected to change
    // underneath a running diff.
    unsafe { Mmap::map(&file) }.with_context(|| format!("mapping {}", path.display()))
}

fn diff(old: &Path, new: &Path, delta: &Path, mode: IndexArg, no_add_block: bool) -> Result<()> {
    let old = map_input(old)?;
    let new = map_input(new)?;

    let mut mode = match mode {
        IndexArg::Suffix => Mode::SUFFIX,
        IndexArg::Hash => Mode::HASH,
    };
    if no_add_block {
        mode = mode.no_add_block();
    }

    let start = Instant::now();
    let out = make_diff(mode, &old, &new, Parts::blocks_only())?;
    info!("diffed {} -> {} bytes in {:?}", old.len(), new.len(), start.elapsed());

    let instr = out.instr_block.unwrap_or_default();
    let add = out.add_block.unwrap_or_default();
    let extra = out.extra_block.unwrap_or_default();

    let mut f = File::create(delta).with_context(|| format!("creating {}", delta.display()))?;
    f.write_all(&MAGIC.to_le_bytes())?;
    f.write_all(&VERSION.to_le_bytes())?;
    f.write_all(&mode.bits().to_le_bytes())?;
    f.write_all(&(new.len() as u64).to_le_bytes())?;
    for block in [&instr, &add, &extra] {
        f.write_all(&(block.len() as u64).to_le_bytes())?;
    }
    for block in [&instr, &add, &extra] {
        f.write_all(block)?;
    }
    f.flush()?;
    Ok(())
}

fn apply(old: &Path, delta: &Path, new: &Path) -> Result<()> {
    let old = map_input(old)?;
    let data = fs::read(delta).with_context(|| format!("reading {}", delta.display()))?;

    let mut off = 0usize;
    let magic = take_u32(&data, &mut off)?;
    if magic != MAGIC {
        bail!("wrong magic: expected {MAGIC:#x}, got {magic:#x}");
    }
    let version = take_u32(&data, &mut off)?;
    if version != VERSION {
        bail!("wrong version: expected {VERSION:#x}, got {version:#x}");
    }
    let _mode = take_u32(&data, &mut off)?;
    let new_len = take_u64(&data, &mut off)?;
    let instr_len = take_u64(&data, &mut off)? as usize;
    let add_len = take_u64(&data, &mut off)? as usize;
    let extra_len = take_u64(&data, &mut off)? as usize;

    let instr = take_bytes(&data, &mut off, instr_len)?;
    let add = take_bytes(&data, &mut off, add_len)?;
    let extra = take_bytes(&data, &mut off, extra_len)?;

    let rebuilt = patch::apply(&old, instr, add, extra)?;
    if rebuilt.len() as u64 != new_len {
        bail!("delta rebuilt {} bytes, header says {new_len}", rebuilt.len());
    }
    fs::write(new, &rebuilt).with_context(|| format!("writing {}", new.display()))?;
    Ok(())
}

fn take_u32(data: &[u8], off: &mut usize) -> Result<u32> {
    let end = *off + 4;
    if end > data.len() {
        bail!("truncated delta file");
    }
    let v = u32::from_le_bytes(data[*off..end].try_into().unwrap());
    *off = end;
    Ok(v)
}

fn take_u64(data: &[u8], off: &mut usize) -> Result<u64> {
    let end = *off + 8;
    if end > data.len() {
        bail!("truncated delta file");
    }
    let v = u64::from_le_bytes(data[*off..end].try_into().unwrap());
    *off = end;
    Ok(v)
}

fn take_bytes<'a>(data: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = off.checked_add(len).filter(|&e| e <= data.len());
    let Some(end) = end else {
        bail!("truncated delta file");
    };
    let s = &data[*off..end];
    *off = end;
    Ok(s)
}
