use std::env;

use serde::{Deserialize, Serialize};

use crate::error::CanopyError;
use crate::ids::RankId;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub rank: RankConfig,
    pub cache: CacheConfig,
    pub donation: DonationConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CANOPY_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CANOPY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            rank: RankConfig::from_env_profiled(p),
            cache: CacheConfig::from_env_profiled(p),
            donation: DonationConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings that cannot describe a running world.
    pub fn validate(&self) -> Result<(), CanopyError> {
        if self.rank.world_size == 0 {
            return Err(CanopyError::Config("world size must be at least 1".into()));
        }
        if self.rank.rank.0 >= self.rank.world_size {
            return Err(CanopyError::UnknownRank(self.rank.rank.0, self.rank.world_size));
        }
        if self.donation.donation_points == 0 {
            return Err(CanopyError::Config("donation budget must be positive".into()));
        }
        if self.donation.round_points < self.donation.donation_points {
            return Err(CanopyError::Config(format!(
                "round budget {} is smaller than the per-donation budget {}",
                self.donation.round_points, self.donation.donation_points
            )));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  rank:      id={}, world_size={}", self.rank.rank, self.rank.world_size);
        tracing::info!("  cache:     max_points={}", self.cache.describe_budget());
        tracing::info!(
            "  donation:  points={}, round_points={}, reverse_permutation={}",
            self.donation.donation_points,
            self.donation.round_points,
            self.donation.serialize_reverse_permutation
        );
    }
}

// ── Rank ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankConfig {
    pub rank: RankId,
    pub world_size: u32,
}

impl RankConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            rank: RankId(profiled_env_u32(p, "CANOPY_RANK", 0)),
            world_size: profiled_env_u32(p, "CANOPY_WORLD_SIZE", 1),
        }
    }
}

// ── Fragment cache ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Points the live cache may hold at once. `u64::MAX` = unlimited.
    pub max_points: u64,
}

impl CacheConfig {
    fn from_env_profiled(p: &str) -> Self {
        // 0 keeps the "unset" meaning so operators can write CANOPY_CACHE_POINTS=0.
        let max_points = match profiled_env_u64(p, "CANOPY_CACHE_POINTS", 0) {
            0 => u64::MAX,
            n => n,
        };
        Self { max_points }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_points == u64::MAX
    }

    fn describe_budget(&self) -> String {
        if self.is_unlimited() { "unlimited".to_string() } else { self.max_points.to_string() }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_points: u64::MAX }
    }
}

// ── Donation ──────────────────────────────────────────────────

pub const DEFAULT_DONATION_POINTS: u64 = 65_536;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationConfig {
    /// Point-transfer budget of a single donated query and its references.
    pub donation_points: u64,
    /// Total point budget for one donation round across query candidates.
    pub round_points: u64,
    /// Whether fragments carry the new-from-old permutation on the wire.
    pub serialize_reverse_permutation: bool,
}

impl DonationConfig {
    fn from_env_profiled(p: &str) -> Self {
        let donation_points = profiled_env_u64(p, "CANOPY_DONATION_POINTS", DEFAULT_DONATION_POINTS);
        Self {
            donation_points,
            round_points: profiled_env_u64(
                p,
                "CANOPY_ROUND_POINTS",
                donation_points.saturating_mul(4),
            ),
            serialize_reverse_permutation: profiled_env_bool(
                p,
                "CANOPY_SERIALIZE_REVERSE_PERMUTATION",
                true,
            ),
        }
    }
}

impl Default for DonationConfig {
    fn default() -> Self {
        Self {
            donation_points: DEFAULT_DONATION_POINTS,
            round_points: DEFAULT_DONATION_POINTS * 4,
            serialize_reverse_permutation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiled_keys_take_precedence() {
        std::env::set_var("CFGTESTA_CANOPY_RANK", "2");
        std::env::set_var("CFGTESTA_CANOPY_WORLD_SIZE", "4");
        std::env::set_var("CFGTESTA_CANOPY_DONATION_POINTS", "100");
        let cfg = Config::for_profile("cfgtesta");
        assert_eq!(cfg.profile, "CFGTESTA");
        assert_eq!(cfg.rank.rank, RankId(2));
        assert_eq!(cfg.rank.world_size, 4);
        assert_eq!(cfg.donation.donation_points, 100);
        assert_eq!(cfg.donation.round_points, 400, "round budget defaults to 4x");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_cache_points_means_unlimited() {
        std::env::set_var("CFGTESTB_CANOPY_CACHE_POINTS", "0");
        let cfg = Config::for_profile("cfgtestb");
        assert!(cfg.cache.is_unlimited());

        std::env::set_var("CFGTESTC_CANOPY_CACHE_POINTS", "5000");
        let cfg = Config::for_profile("cfgtestc");
        assert_eq!(cfg.cache.max_points, 5000);
    }

    #[test]
    fn validate_rejects_rank_outside_world() {
        let mut cfg = Config::for_profile("cfgtestd");
        cfg.rank = RankConfig { rank: RankId(3), world_size: 2 };
        assert!(matches!(cfg.validate(), Err(CanopyError::UnknownRank(3, 2))));
    }

    #[test]
    fn validate_rejects_round_smaller_than_donation() {
        let mut cfg = Config::for_profile("cfgteste");
        cfg.rank = RankConfig { rank: RankId(0), world_size: 1 };
        cfg.donation.donation_points = 10;
        cfg.donation.round_points = 5;
        assert!(matches!(cfg.validate(), Err(CanopyError::Config(_))));
    }

    #[test]
    fn bool_flag_parses_common_spellings() {
        std::env::set_var("CFGTESTF_CANOPY_SERIALIZE_REVERSE_PERMUTATION", "no");
        let cfg = Config::for_profile("cfgtestf");
        assert!(!cfg.donation.serialize_reverse_permutation);
    }
}
