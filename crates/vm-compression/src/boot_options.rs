//! Compression settings read from the kernel command line.

use alloc::string::String;
use core::{fmt, num::ParseIntError};

use snafu::{OptionExt as _, ResultExt as _, Snafu};

const STRATEGY_KEY: &str = "kernel.compression.strategy";
const STORAGE_STRATEGY_KEY: &str = "kernel.compression.storage-strategy";
const THRESHOLD_KEY: &str = "kernel.compression.threshold";

#[derive(Debug, Snafu)]
pub enum BootOptionsError {
    #[snafu(display("invalid value {value:?} for {key}"))]
    InvalidValue {
        #[snafu(implicit)]
        location: snafu::Location,
        key: &'static str,
        value: String,
    },
    #[snafu(display("invalid integer {value:?} for {key}"))]
    InvalidInteger {
        #[snafu(implicit)]
        location: snafu::Location,
        key: &'static str,
        value: String,
        source: ParseIntError,
    },
}

/// Codec selected with `kernel.compression.strategy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionStrategyKind {
    #[default]
    None,
    Lz4,
}

impl CompressionStrategyKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "lz4" => Some(Self::Lz4),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
        })
    }
}

/// Storage backend selected with `kernel.compression.storage-strategy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionStorageStrategyKind {
    #[default]
    None,
    Slot,
}

impl CompressionStorageStrategyKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "slot" => Some(Self::Slot),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionStorageStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Slot => "slot",
        })
    }
}

/// Boot-time compression configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    pub compression_strategy: CompressionStrategyKind,
    pub compression_storage_strategy: CompressionStorageStrategyKind,
    /// Largest accepted compressed size, in percent of a page.
    pub compression_threshold: u32,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            compression_strategy: CompressionStrategyKind::None,
            compression_storage_strategy: CompressionStorageStrategyKind::None,
            compression_threshold: 70,
        }
    }
}

impl BootOptions {
    /// Reads the compression options from a kernel command line.
    ///
    /// The command line is a whitespace-separated list of `key=value` words.
    /// Words that are not compression options are ignored. The threshold is
    /// not range checked here.
    pub fn parse(cmdline: &str) -> Result<Self, BootOptionsError> {
        let mut options = Self::default();
        for (key, value) in cmdline
            .split_whitespace()
            .filter_map(|word| word.split_once('='))
        {
            match key {
                STRATEGY_KEY => {
                    options.compression_strategy = CompressionStrategyKind::from_name(value)
                        .context(InvalidValueSnafu {
                            key: STRATEGY_KEY,
                            value,
                        })?;
                }
                STORAGE_STRATEGY_KEY => {
                    options.compression_storage_strategy =
                        CompressionStorageStrategyKind::from_name(value).context(
                            InvalidValueSnafu {
                                key: STORAGE_STRATEGY_KEY,
                                value,
                            },
                        )?;
                }
                THRESHOLD_KEY => {
                    options.compression_threshold =
                        value.parse().context(InvalidIntegerSnafu {
                            key: THRESHOLD_KEY,
                            value,
                        })?;
                }
                _ => {}
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BootOptions::parse("").unwrap();
        assert_eq!(options, BootOptions::default());
        assert_eq!(options.compression_strategy, CompressionStrategyKind::None);
        assert_eq!(options.compression_threshold, 70);
    }

    #[test]
    fn test_parse() {
        let options = BootOptions::parse(
            "console=ttyS0 kernel.compression.strategy=lz4 quiet \
             kernel.compression.storage-strategy=slot kernel.compression.threshold=50",
        )
        .unwrap();
        assert_eq!(options.compression_strategy, CompressionStrategyKind::Lz4);
        assert_eq!(
            options.compression_storage_strategy,
            CompressionStorageStrategyKind::Slot
        );
        assert_eq!(options.compression_threshold, 50);
    }

    #[test]
    fn test_later_words_win() {
        let options =
            BootOptions::parse("kernel.compression.strategy=lz4 kernel.compression.strategy=none")
                .unwrap();
        assert_eq!(options.compression_strategy, CompressionStrategyKind::None);
    }

    #[test]
    fn test_out_of_range_threshold_is_accepted() {
        let options = BootOptions::parse("kernel.compression.threshold=0").unwrap();
        assert_eq!(options.compression_threshold, 0);
    }

    #[test]
    fn test_invalid_value() {
        let err = BootOptions::parse("kernel.compression.strategy=zstd").unwrap_err();
        assert!(matches!(
            &err,
            BootOptionsError::InvalidValue { key: STRATEGY_KEY, value, .. } if value == "zstd"
        ));
        assert_eq!(
            err.to_string(),
            "invalid value \"zstd\" for kernel.compression.strategy"
        );
    }

    #[test]
    fn test_invalid_integer() {
        let err = BootOptions::parse("kernel.compression.threshold=lots").unwrap_err();
        assert!(matches!(err, BootOptionsError::InvalidInteger { key: THRESHOLD_KEY, .. }));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(CompressionStrategyKind::Lz4.to_string(), "lz4");
        assert_eq!(CompressionStorageStrategyKind::Slot.to_string(), "slot");
    }
}
