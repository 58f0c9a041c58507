//! Environment-variable configuration, read once at load time.
//!
//! Grounded on `original_source/src/io_middle.c`'s `_myhijack_init`, which
//! reads every `IOMIDDLE_*` variable directly from `getenv`. The shape here
//! (a single `Config::from_env`, `thiserror` on misconfiguration, fail fast
//! with context) follows `oxidized-mount-common`'s env-driven config
//! validation rather than the original's `exit(-1)` on a missing care path.

use std::time::Duration;

use crate::error::MiddlewareError;

/// Debug subsystems that can be independently enabled via `IOMIDDLE_DEBUG`.
///
/// Maps onto `tracing` targets instead of re-implementing the original's
/// `DLEVEL_*` bitmask as a standalone gate: each flag below just decides
/// whether its corresponding target is raised to `debug` level at init.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugLevels {
    pub hijack: bool,
    pub bufmgr: bool,
    pub worker: bool,
    pub read: bool,
    pub forwarder: bool,
}

impl DebugLevels {
    const HIJACKED: u32 = 0x2;
    const BUFMGR: u32 = 0x4;
    const WORKER: u32 = 0x10;
    const READ: u32 = 0x20;
    const FWRDR: u32 = 0x40;

    fn from_bitmask(mask: u32) -> Self {
        Self {
            hijack: mask & Self::HIJACKED != 0,
            bufmgr: mask & Self::BUFMGR != 0,
            worker: mask & Self::WORKER != 0,
            read: mask & Self::READ != 0,
            forwarder: mask & Self::FWRDR != 0,
        }
    }

    /// Builds an `EnvFilter` directive string enabling the targets selected
    /// by this bitmask, e.g. `"iomiddle::buffer=debug,iomiddle::worker=debug"`.
    pub fn to_filter_directive(self) -> Option<String> {
        let mut targets = Vec::new();
        if self.hijack {
            targets.push("iomiddle::shim=debug");
        }
        if self.bufmgr {
            targets.push("iomiddle::buffer=debug");
        }
        if self.worker {
            targets.push("iomiddle::worker=debug");
        }
        if self.read {
            targets.push("iomiddle::read=debug");
        }
        if self.forwarder {
            targets.push("iomiddle::exchange=debug");
        }
        if targets.is_empty() {
            None
        } else {
            Some(targets.join(","))
        }
    }
}

/// Per-rank statistics granularity requested via `IOMIDDLE_STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatGranularity {
    #[default]
    Disabled,
    /// `IOMIDDLE_STAT=1`: aggregate per forwarder.
    PerForwarder,
    /// `IOMIDDLE_STAT=2`: aggregate per rank.
    PerRank,
}

/// Middleware configuration, parsed once from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// `IOMIDDLE_CARE_PATH`. Required; a file is managed iff this is a
    /// non-empty proper prefix of its open path.
    pub care_path: String,
    /// `IOMIDDLE_DISABLE`.
    pub disabled: bool,
    /// `IOMIDDLE_DEBUG`.
    pub debug: DebugLevels,
    /// `IOMIDDLE_CONFIRM`.
    pub confirm_banner: bool,
    /// `IOMIDDLE_FORWARDER`. `None` means all-ranks mode (every rank
    /// forwards).
    pub forwarders: Option<u32>,
    /// `IOMIDDLE_LANES`. Forced to 1 when `forwarders` is set.
    pub lanes: u32,
    /// `IOMIDDLE_WORKER`.
    pub worker_enabled: bool,
    /// `IOMIDDLE_TRUNC`.
    pub trunc_enabled: bool,
    /// `IOMIDDLE_STAT`.
    pub stats: StatGranularity,
    /// Timeout used only for the worker's internal panic/cancellation
    /// safety net; not present in the original, added because the Rust
    /// worker is joined cooperatively rather than force-killed at exit.
    pub worker_join_timeout: Duration,
}

impl Config {
    /// Parses configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`MiddlewareError::Configuration`] if `IOMIDDLE_CARE_PATH` is
    /// absent, or if `IOMIDDLE_FORWARDER` is present but does not parse as a
    /// positive integer.
    pub fn from_env() -> Result<Self, MiddlewareError> {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Testable variant of [`Config::from_env`] taking an injected lookup
    /// function instead of reading the real process environment.
    pub fn from_env_with(get: impl Fn(&str) -> Option<String>) -> Result<Self, MiddlewareError> {
        let disabled = get("IOMIDDLE_DISABLE").as_deref() == Some("1");

        let care_path = get("IOMIDDLE_CARE_PATH").ok_or_else(|| {
            MiddlewareError::Configuration(
                "IOMIDDLE_CARE_PATH must be specified".to_string(),
            )
        })?;

        let debug_mask = get("IOMIDDLE_DEBUG")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        let forwarders = match get("IOMIDDLE_FORWARDER") {
            None => None,
            Some(s) => {
                let n: u32 = s.parse().map_err(|_| {
                    MiddlewareError::Configuration(format!(
                        "IOMIDDLE_FORWARDER must be a positive integer, got {s:?}"
                    ))
                })?;
                if n == 0 {
                    return Err(MiddlewareError::Configuration(
                        "IOMIDDLE_FORWARDER must be positive".to_string(),
                    ));
                }
                Some(n)
            }
        };

        let mut lanes = get("IOMIDDLE_LANES")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(1);
        if forwarders.is_some() {
            // "IOMIDDLE_LANES ... ignored (forced to 1) when forwarders are used."
            lanes = 1;
        }

        let stats = match get("IOMIDDLE_STAT").as_deref() {
            Some("1") => StatGranularity::PerForwarder,
            Some("2") => StatGranularity::PerRank,
            _ => StatGranularity::Disabled,
        };

        Ok(Config {
            care_path,
            disabled,
            debug: DebugLevels::from_bitmask(debug_mask),
            confirm_banner: get("IOMIDDLE_CONFIRM").is_some(),
            forwarders,
            lanes,
            worker_enabled: get("IOMIDDLE_WORKER").as_deref() == Some("1"),
            trunc_enabled: get("IOMIDDLE_TRUNC").as_deref() == Some("1"),
            stats,
            worker_join_timeout: Duration::from_secs(30),
        })
    }

    /// Validates that `forwarders` evenly divides `nprocs`, per §4.5's "the
    /// exact division must be exact (fatal otherwise)".
    pub fn validate_against(&self, nprocs: u32) -> Result<(), MiddlewareError> {
        if let Some(f) = self.forwarders {
            if f > nprocs || nprocs % f != 0 {
                return Err(MiddlewareError::Configuration(format!(
                    "IOMIDDLE_FORWARDER={f} does not evenly divide nprocs={nprocs}"
                )));
            }
        }
        Ok(())
    }
}
