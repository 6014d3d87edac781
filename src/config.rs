//! Configuration.
//!
//! Not TOML: the wire format is SnapRAID's own line-oriented
//! `key value...` grammar — one directive per line, blank lines and `#`
//! comments ignored. `parse_size` below turns a suffixed size string
//! (`"500G"`, `"64M"`) into a byte count for `autosave` and similar
//! directives, using the single-letter binary suffixes (`K`/`M`/`G`) this
//! grammar actually uses.

use crate::error::ConfigError;
use crate::filter::Filter;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The `snapraid_option` flag vocabulary, carried verbatim since it gates
/// required engine behavior (safety gates, scrub selection, text-vs-binary
/// content writes) down to individual flag names.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub force_zero: bool,
    pub force_empty: bool,
    pub force_uuid: bool,
    pub force_device: bool,
    pub force_nocopy: bool,
    pub force_full: bool,
    pub expect_unrecoverable: bool,
    pub expect_recoverable: bool,
    pub skip_device: bool,
    pub skip_sign: bool,
    pub skip_fallocate: bool,
    pub skip_sequential: bool,
    pub skip_lock: bool,
    pub skip_content_check: bool,
    pub force_murmur3: bool,
    pub force_spooky2: bool,
    pub force_scrub: bool,
    pub force_scrub_even: bool,
    pub force_content_write: bool,
    pub force_content_text: bool,
}

#[derive(Debug, Clone)]
pub struct DataDisk {
    pub name: String,
    pub path: PathBuf,
}

/// The parsed form of a `.conf` file: parity paths by level, content
/// paths, data disks, block/hash sizing, autosave threshold, pool/share
/// paths, and filter rules.
#[derive(Debug, Clone)]
pub struct Config {
    pub parity_paths: HashMap<u8, Vec<PathBuf>>,
    pub content_paths: Vec<PathBuf>,
    pub data_disks: Vec<DataDisk>,
    pub block_size: u64,
    pub hash_size: usize,
    pub autosave_bytes: Option<u64>,
    pub pool: Option<PathBuf>,
    pub share: Option<PathBuf>,
    pub smartctl: Option<String>,
    pub nohidden: bool,
    pub filter: Filter,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            parity_paths: HashMap::new(),
            content_paths: Vec::new(),
            data_disks: Vec::new(),
            block_size: 256 * 1024,
            hash_size: 16,
            autosave_bytes: None,
            pool: None,
            share: None,
            smartctl: None,
            nohidden: false,
            filter: Filter::new(),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("").trim();
            let line = lineno + 1;

            match key {
                "parity" => push_parity(&mut cfg, 1, rest, line)?,
                "2-parity" | "3-parity" | "4-parity" | "5-parity" | "6-parity" => {
                    let level: u8 = key.chars().next().unwrap().to_digit(10).unwrap() as u8;
                    push_parity(&mut cfg, level, rest, line)?;
                }
                "content" => cfg.content_paths.push(PathBuf::from(rest)),
                "data" => {
                    let mut it = rest.splitn(2, char::is_whitespace);
                    let name = it.next().ok_or_else(|| parse_err(line, "`data` needs a name and a path"))?;
                    let path = it.next().ok_or_else(|| parse_err(line, "`data` needs a name and a path"))?;
                    cfg.data_disks.push(DataDisk { name: name.to_string(), path: PathBuf::from(path.trim()) });
                }
                "exclude" => cfg.filter.exclude_path(rest),
                "include" => cfg.filter.include_path(rest),
                "blocksize" => {
                    let bytes = parse_size(rest).map_err(|_| parse_err(line, "bad `blocksize`"))?;
                    if !bytes.is_power_of_two() || !(1024..=64 * 1024 * 1024).contains(&bytes) {
                        return Err(ConfigError::BadBlockSize(bytes));
                    }
                    cfg.block_size = bytes;
                }
                "hashsize" => {
                    cfg.hash_size = rest.parse().map_err(|_| parse_err(line, "bad `hashsize`"))?;
                }
                "autosave" => {
                    cfg.autosave_bytes = Some(parse_size(rest).map_err(|_| parse_err(line, "bad `autosave`"))?);
                }
                "pool" => cfg.pool = Some(PathBuf::from(rest)),
                "share" => cfg.share = Some(PathBuf::from(rest)),
                "smartctl" => cfg.smartctl = Some(rest.to_string()),
                "nohidden" => cfg.nohidden = true,
                other => return Err(parse_err(line, &format!("unknown directive `{other}`"))),
            }
        }

        if cfg.content_paths.is_empty() {
            return Err(ConfigError::MissingContent);
        }
        if cfg.parity_paths.is_empty() {
            return Err(ConfigError::MissingParity(1));
        }
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parity_level(&self) -> u8 {
        self.parity_paths.keys().copied().max().unwrap_or(0)
    }
}

fn push_parity(cfg: &mut Config, level: u8, path: &str, line: usize) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(parse_err(line, "parity directive needs a path"));
    }
    if level == 0 || level > crate::codec::MAX_PARITY_LEVEL {
        return Err(ConfigError::BadParityLevel(level));
    }
    cfg.parity_paths.entry(level).or_default().push(PathBuf::from(path));
    Ok(())
}

fn parse_err(line: usize, message: &str) -> ConfigError {
    ConfigError::Parse { line, message: message.to_string() }
}

/// Parses a byte count with an optional single-letter suffix: `K`/`M`/`G`
/// (binary, 1024-based), or a plain byte count with no suffix.
pub fn parse_size(input: &str) -> Result<u64, std::num::ParseFloatError> {
    let trimmed = input.trim().to_uppercase();
    let (number_part, multiplier) = if let Some(s) = trimmed.strip_suffix('G') {
        (s, 1024u64 * 1024 * 1024)
    } else if let Some(s) = trimmed.strip_suffix('M') {
        (s, 1024u64 * 1024)
    } else if let Some(s) = trimmed.strip_suffix('K') {
        (s, 1024u64)
    } else {
        (trimmed.as_str(), 1u64)
    };
    let value: f64 = number_part.trim().parse()?;
    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# a comment
parity /mnt/parity/snapraid.parity
2-parity /mnt/parity2/snapraid.2-parity
content /var/snapraid/snapraid.content
content /mnt/disk1/snapraid.content
data d1 /mnt/disk1
data d2 /mnt/disk2
exclude *.tmp
blocksize 262144
autosave 500G
nohidden
";

    #[test]
    fn parses_full_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.content_paths.len(), 2);
        assert_eq!(cfg.data_disks.len(), 2);
        assert_eq!(cfg.parity_level(), 2);
        assert_eq!(cfg.block_size, 262_144);
        assert!(cfg.nohidden);
        assert_eq!(cfg.autosave_bytes, Some(500 * 1024 * 1024 * 1024));
        assert!(!cfg.filter.allows_path("scratch.tmp"));
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = Config::parse("bogus thing\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn requires_at_least_one_content_path() {
        let err = Config::parse("parity /mnt/p/snapraid.parity\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingContent));
    }

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("500M").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1024").unwrap(), 1024);
    }
}
