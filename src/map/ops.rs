//! # Offline Map Operations
//!
//! The tool surface behind the CLI: Base64 import/export, the rewrite
//! ("optimize") path, and offline stats that read the per-partition
//! records without opening the partitions.
//!
//! ## Text Format
//!
//! One key per line, each token Base64: `b64(key) b64(v1) b64(v2) ...`,
//! separated by whitespace. Import accepts a single file or a directory
//! of files (hidden entries skipped) and fails fast on the first
//! malformed token, naming the file and line.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use eyre::{bail, Result, WrapErr};

use crate::config::Options;
use crate::encoding::base64;
use crate::map::{id_path, lock_path, partition_prefix, DirectoryLock, Map, MapId};
use crate::partition::{Partition, Stats};

/// Comparator for value sorting during export/optimize: returns whether
/// `a` orders before `b`.
pub type ValueCompare<'a> = &'a dyn Fn(&[u8], &[u8]) -> Ordering;

/// Reads the per-partition stats records of a closed map. Takes the
/// directory lock for the duration but opens no partition.
pub fn stats(directory: impl AsRef<Path>) -> Result<Vec<Stats>> {
    let directory = directory.as_ref();
    let _lock = DirectoryLock::acquire(&lock_path(directory))?;
    let id = MapId::read_from_file(&id_path(directory))?;
    id.check_version()?;
    let mut all = Vec::with_capacity(id.num_partitions() as usize);
    for index in 0..id.num_partitions() {
        let path = Partition::stats_path(&partition_prefix(directory, index));
        all.push(Stats::read_from_file(&path)?);
    }
    Ok(all)
}

/// Imports whitespace-delimited Base64 key/value lines from a file or a
/// directory of files into the map at `directory`.
pub fn import_from_base64(
    directory: impl AsRef<Path>,
    input: impl AsRef<Path>,
    options: &Options,
) -> Result<()> {
    let input = input.as_ref();
    let map = Map::with_options(directory, options)?;

    if input.is_file() {
        import_file(&map, input, options.quiet)?;
    } else if input.is_dir() {
        let mut paths: Vec<_> = std::fs::read_dir(input)
            .wrap_err_with(|| format!("failed to list '{}'", input.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && !path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with('.'))
            })
            .collect();
        paths.sort();
        for path in paths {
            import_file(&map, &path, options.quiet)?;
        }
    } else {
        bail!("no such file or directory '{}'", input.display());
    }
    map.close()
}

fn import_file(map: &Map, path: &Path, quiet: bool) -> Result<()> {
    if !quiet {
        println!("Importing {}", path.display());
    }
    let file =
        File::open(path).wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
    let reader = BufReader::new(file);
    for (line_index, line) in reader.lines().enumerate() {
        let line =
            line.wrap_err_with(|| format!("failed to read '{}'", path.display()))?;
        let mut tokens = line.split_whitespace();
        let Some(key_token) = tokens.next() else {
            continue;
        };
        let context = |what: &str| {
            format!("{}:{}: bad {} token", path.display(), line_index + 1, what)
        };
        let key = base64::decode(key_token).wrap_err_with(|| context("key"))?;
        for value_token in tokens {
            let value = base64::decode(value_token).wrap_err_with(|| context("value"))?;
            map.put(&key, &value)?;
        }
    }
    Ok(())
}

/// Exports every entry of the map at `directory` as Base64 lines,
/// optionally sorting each list's values with `compare`.
pub fn export_to_base64(
    directory: impl AsRef<Path>,
    output: impl AsRef<Path>,
    options: &Options,
    compare: Option<ValueCompare>,
) -> Result<()> {
    let output = output.as_ref();
    let map = Map::with_options(
        directory,
        &Options {
            readonly: true,
            create_if_missing: false,
            error_if_exists: false,
            ..options.clone()
        },
    )?;
    if !options.quiet {
        println!("Exporting {} to {}", map.directory().display(), output.display());
    }

    let file = File::create(output)
        .wrap_err_with(|| format!("failed to create '{}'", output.display()))?;
    let mut writer = BufWriter::new(file);
    map.for_each_entry(|key, iter| {
        write!(writer, "{}", base64::encode(key))?;
        match compare {
            Some(compare) => {
                let mut values = Vec::with_capacity(iter.available() as usize);
                while let Some(value) = iter.next()? {
                    values.push(value.to_vec());
                }
                values.sort_by(|a, b| compare(a, b));
                for value in &values {
                    write!(writer, " {}", base64::encode(value))?;
                }
            }
            None => {
                while let Some(value) = iter.next()? {
                    write!(writer, " {}", base64::encode(value))?;
                }
            }
        }
        writeln!(writer)?;
        Ok(())
    })?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|file| file.sync_all())
        .wrap_err_with(|| format!("failed to finish '{}'", output.display()))?;
    map.close()
}

/// Rewrites the map at `directory` into a fresh map at `output`,
/// optionally reshaping block size and partition count (zero keeps the
/// source value) and sorting each list with `compare`. The destination
/// must not already contain a map.
pub fn optimize(
    directory: impl AsRef<Path>,
    output: impl AsRef<Path>,
    options: &Options,
    compare: Option<ValueCompare>,
) -> Result<()> {
    let source = Map::with_options(
        directory,
        &Options {
            readonly: true,
            create_if_missing: false,
            error_if_exists: false,
            ..options.clone()
        },
    )?;
    let destination = Map::with_options(
        output,
        &Options {
            block_size: if options.block_size == 0 {
                source.block_size()
            } else {
                options.block_size
            },
            num_partitions: if options.num_partitions == 0 {
                source.num_partitions()
            } else {
                options.num_partitions
            },
            create_if_missing: true,
            error_if_exists: true,
            readonly: false,
            ..options.clone()
        },
    )?;
    if !options.quiet {
        println!(
            "Optimizing {} into {}",
            source.directory().display(),
            destination.directory().display()
        );
    }

    source.for_each_entry(|key, iter| {
        match compare {
            Some(compare) => {
                let mut values = Vec::with_capacity(iter.available() as usize);
                while let Some(value) = iter.next()? {
                    values.push(value.to_vec());
                }
                values.sort_by(|a, b| compare(a, b));
                for value in &values {
                    destination.put(key, value)?;
                }
            }
            None => {
                while let Some(value) = iter.next()? {
                    destination.put(key, value)?;
                }
            }
        }
        Ok(())
    })?;
    destination.close()?;
    source.close()
}
