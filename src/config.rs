//! Configuration for the payload verifier.
//!
//! Selects the game, the service environment (and with it the trust anchor), which optional
//! patch levels apply, and where patches may be written.

use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::code::Arch;
use crate::crypto::{Digest, Environment, DIGEST_SIZE};
use crate::error::ConfigError;
use crate::fetch::RetryPolicy;
use crate::format::{GameId, PatchLevel, BODY_OFFSET, PAYLOAD_BLOCK_SIZE};

/// Main verifier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Game id sent to the server and expected in the payload, e.g. `RMCPD00`
    pub game: String,

    /// Service environment; selects the signing key and default domain
    #[serde(default)]
    pub environment: Environment,

    /// Service domain, overriding the environment's default
    #[serde(default)]
    pub domain: Option<String>,

    /// Target architecture for branch encoding
    #[serde(default)]
    pub arch: Arch,

    /// Optional patch levels to apply
    #[serde(default)]
    pub patch_levels: PatchLevels,

    /// Target ranges patches may be written to (empty = the whole target image)
    #[serde(default)]
    pub regions: Vec<RegionConfig>,

    /// Address to load and relocate the payload at; unset leaves the payload unloaded
    #[serde(default)]
    pub load_address: Option<u32>,

    /// Largest payload accepted from the server, in bytes
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Expected stage0 digest as 64 hex characters
    #[serde(default)]
    pub pinned_digest: Option<String>,

    /// Bound for each request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Stage1 retry behavior
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl VerifierConfig {
    /// Configuration for `game` with every other field at its default
    pub fn new(game: impl Into<String>) -> Self {
        Self {
            game: game.into(),
            environment: Environment::default(),
            domain: None,
            arch: Arch::default(),
            patch_levels: PatchLevels::default(),
            regions: Vec::new(),
            load_address: None,
            max_payload_size: default_max_payload_size(),
            pinned_digest: None,
            request_timeout_secs: default_request_timeout(),
            retry: RetryPolicy::default(),
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks every field that can be checked without the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.game_id()?;
        self.pinned_digest()?;
        for region in &self.regions {
            if region.start >= region.end {
                return Err(ConfigError::Invalid {
                    field: "regions",
                    reason: format!("{:#x}..{:#x} is empty", region.start, region.end),
                });
            }
        }
        if self.max_payload_size < BODY_OFFSET {
            return Err(ConfigError::Invalid {
                field: "max_payload_size",
                reason: format!("must be at least {BODY_OFFSET:#x} bytes"),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_secs",
                reason: "must be positive".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Game id in payload form
    pub fn game_id(&self) -> Result<GameId, ConfigError> {
        GameId::new(&self.game).ok_or_else(|| ConfigError::Invalid {
            field: "game",
            reason: format!("{:?} is not a game id of 1 to 12 ASCII characters", self.game),
        })
    }

    /// Service domain in effect
    pub fn domain(&self) -> &str {
        self.domain
            .as_deref()
            .unwrap_or_else(|| self.environment.domain())
    }

    /// Decoded pinned digest, if any
    pub fn pinned_digest(&self) -> Result<Option<Digest>, ConfigError> {
        let Some(hex_digest) = &self.pinned_digest else {
            return Ok(None);
        };
        let mut digest = [0; DIGEST_SIZE];
        hex::decode_to_slice(hex_digest, &mut digest).map_err(|e| ConfigError::Invalid {
            field: "pinned_digest",
            reason: e.to_string(),
        })?;
        Ok(Some(digest))
    }

    /// Permitted write regions
    pub fn regions(&self) -> Vec<Range<u32>> {
        self.regions.iter().map(|r| r.start..r.end).collect()
    }

    /// Bound for each request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Which optional patch levels apply. Critical patches always apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchLevels {
    /// Fixes for bugs in the game
    pub bugfix: bool,
    /// Changes that keep players on equal footing
    pub parity: bool,
    /// New features
    pub feature: bool,
    /// Support tooling
    pub support: bool,
}

impl Default for PatchLevels {
    fn default() -> Self {
        Self {
            bugfix: true,
            parity: true,
            feature: true,
            support: true,
        }
    }
}

impl PatchLevels {
    /// Enabled levels as a mask
    pub fn mask(&self) -> PatchLevel {
        [
            (self.bugfix, PatchLevel::BUGFIX),
            (self.parity, PatchLevel::PARITY),
            (self.feature, PatchLevel::FEATURE),
            (self.support, PatchLevel::SUPPORT),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(PatchLevel::CRITICAL, |mask, (_, level)| mask | level)
    }
}

/// A permitted write region, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// First address
    pub start: u32,
    /// One past the last address
    pub end: u32,
}

fn default_max_payload_size() -> usize {
    PAYLOAD_BLOCK_SIZE
}

fn default_request_timeout() -> u64 {
    30
}
