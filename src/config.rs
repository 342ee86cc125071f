//! Configuration for Concord
//!
//! CLI arguments and environment variable handling using clap. Every flag
//! can also be set through the environment (or a `.env` file).

use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::cooldown::CooldownConfig;
use crate::leader::LeaderConfig;
use crate::suppressor::SuppressorConfig;
use crate::tickets::{LifecycleConfig, StaticPolicy};
use crate::types::{ConcordError, Result};

/// Concord - process coordination for the community bot
#[derive(Parser, Debug, Clone)]
#[command(name = "concord")]
#[command(about = "Leader election, ticket lifecycle and rate limiting for the community bot")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Enable development mode (in-memory store when no MongoDB URI is set)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI (required outside dev mode)
    #[arg(long, env = "MONGODB_URI")]
    pub mongodb_uri: Option<String>,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "concord")]
    pub mongodb_db: String,

    /// How often the leader lock is re-read
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value = "5000")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive failed lock reads before stepping down
    #[arg(long, env = "HEARTBEAT_MAX_FAILURES", default_value = "3")]
    pub heartbeat_max_failures: u32,

    /// Per-actor cooldown between ticket creations
    #[arg(long, env = "CREATE_COOLDOWN_MS", default_value = "30000")]
    pub create_cooldown_ms: u64,

    /// Per-actor cooldown for each named trigger
    #[arg(long, env = "TRIGGER_COOLDOWN_MS", default_value = "10000")]
    pub trigger_cooldown_ms: u64,

    /// Sweep interval for cooldown and burst maps
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "60000")]
    pub sweep_interval_ms: u64,

    /// Burst detection window
    #[arg(long, env = "BURST_WINDOW_MS", default_value = "60000")]
    pub burst_window_ms: u64,

    /// Events per window that count as a burst
    #[arg(long, env = "BURST_THRESHOLD", default_value = "5")]
    pub burst_threshold: usize,

    /// Open tickets allowed per subject per category
    #[arg(long, env = "DEFAULT_TICKET_QUOTA", default_value = "1")]
    pub default_ticket_quota: u32,

    /// Per-category quota overrides, e.g. "support=1,appeal=2"
    #[arg(long, env = "CATEGORY_QUOTAS")]
    pub category_quotas: Option<String>,

    /// Idle time before a full quota slot may be recounted from open tickets
    #[arg(long, env = "QUOTA_REPAIR_AFTER_MS", default_value = "30000")]
    pub quota_repair_after_ms: u64,

    /// Comma-separated staff actor ids
    #[arg(long, env = "STAFF_IDS", default_value = "")]
    pub staff_ids: String,

    /// Comma-separated actor ids exempt from ticket quotas
    #[arg(long, env = "QUOTA_BYPASS_IDS", default_value = "")]
    pub quota_bypass_ids: String,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if !self.dev_mode && self.mongodb_uri.is_none() {
            return Err(ConcordError::Config(
                "MONGODB_URI is required outside dev mode".to_string(),
            ));
        }

        let intervals = [
            ("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms),
            ("SWEEP_INTERVAL_MS", self.sweep_interval_ms),
            ("BURST_WINDOW_MS", self.burst_window_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConcordError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.heartbeat_max_failures == 0 {
            return Err(ConcordError::Config(
                "HEARTBEAT_MAX_FAILURES must be greater than 0".to_string(),
            ));
        }
        if self.burst_threshold == 0 {
            return Err(ConcordError::Config(
                "BURST_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.default_ticket_quota == 0 {
            return Err(ConcordError::Config(
                "DEFAULT_TICKET_QUOTA must be greater than 0".to_string(),
            ));
        }

        self.category_quota_map()?;
        Ok(())
    }

    /// Parse `CATEGORY_QUOTAS`
    pub fn category_quota_map(&self) -> Result<HashMap<String, u32>> {
        let Some(raw) = self.category_quotas.as_deref() else {
            return Ok(HashMap::new());
        };

        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let (category, max) = pair.split_once('=').ok_or_else(|| {
                    ConcordError::Config(format!("Invalid CATEGORY_QUOTAS entry '{}'", pair))
                })?;
                let max: u32 = max.trim().parse().map_err(|_| {
                    ConcordError::Config(format!("Invalid quota in CATEGORY_QUOTAS entry '{}'", pair))
                })?;
                if max == 0 {
                    return Err(ConcordError::Config(format!(
                        "Quota for '{}' must be greater than 0",
                        category.trim()
                    )));
                }
                Ok((category.trim().to_string(), max))
            })
            .collect()
    }

    pub fn staff_list(&self) -> Vec<String> {
        split_ids(&self.staff_ids)
    }

    pub fn quota_bypass_list(&self) -> Vec<String> {
        split_ids(&self.quota_bypass_ids)
    }

    pub fn leader_config(&self) -> LeaderConfig {
        LeaderConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_consecutive_failures: self.heartbeat_max_failures,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let sweep_interval = Duration::from_millis(self.sweep_interval_ms);
        CoordinatorConfig {
            create_cooldown: CooldownConfig {
                window: Duration::from_millis(self.create_cooldown_ms),
                sweep_interval,
            },
            trigger_cooldown: CooldownConfig {
                window: Duration::from_millis(self.trigger_cooldown_ms),
                sweep_interval,
            },
            suppressor: SuppressorConfig {
                window: Duration::from_millis(self.burst_window_ms),
                threshold: self.burst_threshold,
                sweep_interval,
            },
        }
    }

    pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
        Ok(LifecycleConfig {
            default_max_open: self.default_ticket_quota,
            category_max_open: self.category_quota_map()?,
            quota_repair_after: Duration::from_millis(self.quota_repair_after_ms),
        })
    }

    pub fn access_policy(&self) -> StaticPolicy {
        StaticPolicy::new(self.staff_list(), self.quota_bypass_list())
    }
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::AccessPolicy;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["concord"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());

        let leader = args.leader_config();
        assert_eq!(leader.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(leader.max_consecutive_failures, 3);

        let lifecycle = args.lifecycle_config().unwrap();
        assert_eq!(lifecycle.max_open("support"), 1);
        assert_eq!(lifecycle.quota_repair_after, Duration::from_secs(30));
    }

    #[test]
    fn test_mongo_required_outside_dev_mode() {
        let args = parse(&[]);
        assert!(matches!(args.validate(), Err(ConcordError::Config(_))));

        let args = parse(&["--mongodb-uri", "mongodb://localhost:27017"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_category_quotas() {
        let args = parse(&["--dev-mode", "--category-quotas", "support=1, appeal=2"]);
        let lifecycle = args.lifecycle_config().unwrap();
        assert_eq!(lifecycle.max_open("appeal"), 2);
        assert_eq!(lifecycle.max_open("report"), 1);

        for bad in ["support", "support=x", "support=0"] {
            let args = parse(&["--dev-mode", "--category-quotas", bad]);
            assert!(args.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_zero_values_rejected() {
        for flag in ["--heartbeat-interval-ms", "--burst-threshold", "--sweep-interval-ms"] {
            let args = parse(&["--dev-mode", flag, "0"]);
            assert!(args.validate().is_err(), "{flag}=0 should be rejected");
        }
    }

    #[test]
    fn test_actor_lists() {
        let args = parse(&["--dev-mode", "--staff-ids", "mod-1, mod-2,", "--quota-bypass-ids", "vip"]);
        assert_eq!(args.staff_list(), ["mod-1", "mod-2"]);

        let policy = args.access_policy();
        assert!(policy.is_staff("mod-2"));
        assert!(policy.can_bypass_quota("vip"));
        assert!(!policy.is_staff("vip"));
    }
}
