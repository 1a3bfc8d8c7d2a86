//! # Command-Line Interface
//!
//! The `multimap` tool: inspect, import, export, and rewrite maps.
//!
//! ```bash
//! multimap stats    <map_dir> [--quiet]
//! multimap import   <map_dir> <path> [--create] [--bs N] [--nparts N] [--quiet]
//! multimap export   <map_dir> <path> [--quiet]
//! multimap optimize <map_dir> <out_dir> [--bs N] [--nparts N] [--quiet]
//! ```
//!
//! Exit status is zero on success; any failure prints a diagnostic to
//! stderr and exits non-zero (handled by the binary entry point).

use std::path::PathBuf;

use eyre::{bail, ensure, Result, WrapErr};

use crate::config::Options;
use crate::map::ops;
use crate::partition::Stats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Help,
    Stats,
    Import,
    Export,
    Optimize,
}

#[derive(Debug)]
struct CommandLine {
    command: Command,
    map_dir: PathBuf,
    path: Option<PathBuf>,
    create: bool,
    block_size: Option<u32>,
    num_partitions: Option<u32>,
    quiet: bool,
}

fn parse(args: &[String]) -> Result<CommandLine> {
    let mut words = args.iter();
    let command = match words.next().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => {
            return Ok(CommandLine {
                command: Command::Help,
                map_dir: PathBuf::new(),
                path: None,
                create: false,
                block_size: None,
                num_partitions: None,
                quiet: false,
            })
        }
        Some("stats") => Command::Stats,
        Some("import") => Command::Import,
        Some("export") => Command::Export,
        Some("optimize") => Command::Optimize,
        Some(other) => bail!("unknown command '{}', try 'multimap help'", other),
    };

    let mut map_dir = None;
    let mut path = None;
    let mut create = false;
    let mut block_size = None;
    let mut num_partitions = None;
    let mut quiet = false;

    while let Some(word) = words.next() {
        match word.as_str() {
            "--create" => create = true,
            "--quiet" => quiet = true,
            "--bs" => {
                let value = words.next().ok_or_else(|| eyre::eyre!("missing value for --bs"))?;
                block_size = Some(value.parse().wrap_err("bad value for --bs")?);
            }
            "--nparts" => {
                let value = words
                    .next()
                    .ok_or_else(|| eyre::eyre!("missing value for --nparts"))?;
                num_partitions = Some(value.parse().wrap_err("bad value for --nparts")?);
            }
            flag if flag.starts_with('-') => bail!("unknown option '{}'", flag),
            positional => {
                if map_dir.is_none() {
                    map_dir = Some(PathBuf::from(positional));
                } else if path.is_none() {
                    path = Some(PathBuf::from(positional));
                } else {
                    bail!("unexpected argument '{}'", positional);
                }
            }
        }
    }

    let map_dir = map_dir.ok_or_else(|| eyre::eyre!("missing MAP argument"))?;
    Ok(CommandLine {
        command,
        map_dir,
        path,
        create,
        block_size,
        num_partitions,
        quiet,
    })
}

fn print_usage() {
    println!("multimap - persistent 1-to-N key-value store");
    println!();
    println!("USAGE:");
    println!("    multimap COMMAND MAP [PATH] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    help          Print this help message and exit");
    println!("    stats         Print statistics about a map");
    println!("    import        Import key-value pairs from Base64 text files");
    println!("    export        Export key-value pairs to a Base64 text file");
    println!("    optimize      Rewrite a map into PATH, defragmenting it");
    println!();
    println!("OPTIONS:");
    println!("    --create      Create the map when importing into a missing one");
    println!("    --bs NUM      Block size for a new map (default 512; optimize: keep)");
    println!("    --nparts NUM  Partition count for a new map (default 23; optimize: keep)");
    println!("    --quiet       Suppress progress output");
    println!();
    println!("EXAMPLES:");
    println!("    multimap stats path/to/map");
    println!("    multimap import path/to/map path/to/input.b64 --create");
    println!("    multimap export path/to/map path/to/output.b64");
    println!("    multimap optimize path/to/map path/to/rewritten --bs 128 --nparts 46");
}

fn print_stats(label: &str, stats: &Stats) {
    println!("{label}");
    println!("  block_size          {}", stats.block_size);
    println!("  num_blocks          {}", stats.num_blocks);
    println!("  num_keys            {}", stats.num_keys);
    println!("  num_values_added    {}", stats.num_values_added);
    println!("  num_values_removed  {}", stats.num_values_removed);
    println!("  num_values_unowned  {}", stats.num_values_unowned);
    println!("  num_values_valid    {}", stats.num_values_valid());
    println!("  key_size_min        {}", stats.key_size_min);
    println!("  key_size_max        {}", stats.key_size_max);
    println!("  key_size_avg        {}", stats.key_size_avg);
    println!("  list_size_min       {}", stats.list_size_min);
    println!("  list_size_max       {}", stats.list_size_max);
    println!("  list_size_avg       {}", stats.list_size_avg);
}

fn run_stats(cmd: &CommandLine) -> Result<()> {
    let all = ops::stats(&cmd.map_dir)?;
    if !cmd.quiet {
        for (index, stats) in all.iter().enumerate() {
            print_stats(&format!("partition {index}"), stats);
        }
    }
    print_stats("total", &Stats::total(&all));
    Ok(())
}

fn run_import(cmd: &CommandLine) -> Result<()> {
    let input = cmd
        .path
        .as_ref()
        .ok_or_else(|| eyre::eyre!("import needs an input PATH"))?;
    let options = Options {
        create_if_missing: cmd.create,
        block_size: cmd.block_size.unwrap_or(Options::default().block_size),
        num_partitions: cmd.num_partitions.unwrap_or(Options::default().num_partitions),
        quiet: cmd.quiet,
        ..Options::default()
    };
    ops::import_from_base64(&cmd.map_dir, input, &options)
}

fn run_export(cmd: &CommandLine) -> Result<()> {
    let output = cmd
        .path
        .as_ref()
        .ok_or_else(|| eyre::eyre!("export needs an output PATH"))?;
    let options = Options {
        quiet: cmd.quiet,
        ..Options::default()
    };
    ops::export_to_base64(&cmd.map_dir, output, &options, None)
}

fn run_optimize(cmd: &CommandLine) -> Result<()> {
    let output = cmd
        .path
        .as_ref()
        .ok_or_else(|| eyre::eyre!("optimize needs an output PATH"))?;
    ensure!(
        cmd.block_size != Some(0),
        "--bs must be positive; omit it to keep the source block size"
    );
    ensure!(
        cmd.num_partitions != Some(0),
        "--nparts must be positive; omit it to keep the source partition count"
    );
    let options = Options {
        // Zero means "keep the source value" on the optimize path.
        block_size: cmd.block_size.unwrap_or(0),
        num_partitions: cmd.num_partitions.unwrap_or(0),
        quiet: cmd.quiet,
        ..Options::default()
    };
    ops::optimize(&cmd.map_dir, output, &options, None)
}

/// Parses and runs a command line (without the program name).
pub fn run(args: &[String]) -> Result<()> {
    let cmd = parse(args)?;
    match cmd.command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Stats => run_stats(&cmd),
        Command::Import => run_import(&cmd),
        Command::Export => run_export(&cmd),
        Command::Optimize => run_optimize(&cmd),
    }
}
