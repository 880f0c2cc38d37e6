//! Vault renewal configuration.
//!
//! Loaded from the `[vault]` table of the agent's TOML config, or from a
//! standalone file whose top level is that table. Durations are strings
//! (`"500ms"`, `"30s"`, `"5m"`, `"72h"`) and are resolved into a
//! [`RenewalPolicy`] before the renewer is built.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Master switch. A disabled renewer accepts no registrations.
    pub enabled: bool,
    /// Vault address, `http://host:port` or `host:port`.
    pub address: String,
    /// Agent token, used to renew secret leases.
    pub token: Option<String>,
    /// Increment requested when a caller passes zero.
    pub task_token_ttl: String,
    /// Backoff after a transient renewal failure.
    pub connection_retry_interval: String,
    /// Fraction of the granted lease duration to wait before renewing.
    pub renewal_fraction: f64,
    /// Lower bound on the delay between renewals of the same lease.
    pub min_renewal_interval: String,
    /// Per-request timeout for the HTTP client.
    pub request_timeout: String,
    /// How long `stop()` waits for the renewal loop before aborting it.
    pub stop_timeout: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "http://127.0.0.1:8200".to_string(),
            token: None,
            task_token_ttl: "72h".to_string(),
            connection_retry_interval: "30s".to_string(),
            renewal_fraction: 0.5,
            min_renewal_interval: "1s".to_string(),
            request_timeout: "10s".to_string(),
            stop_timeout: "15s".to_string(),
        }
    }
}

/// Wrapper for agent config files that nest the settings under `[vault]`.
#[derive(Debug, Deserialize)]
struct AgentFile {
    vault: VaultConfig,
}

impl VaultConfig {
    /// Parse TOML, accepting either a `[vault]` table or top-level keys.
    pub fn from_toml_str(content: &str) -> VaultResult<Self> {
        let value: toml::Value =
            toml::from_str(content).map_err(|e| VaultError::Config(e.to_string()))?;

        let config = if value.get("vault").is_some() {
            value
                .try_into::<AgentFile>()
                .map(|f| f.vault)
                .map_err(|e| VaultError::Config(e.to_string()))?
        } else {
            value
                .try_into::<VaultConfig>()
                .map_err(|e| VaultError::Config(e.to_string()))?
        };

        config.policy()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> VaultResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VaultError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Validate the config and resolve its duration strings.
    pub fn policy(&self) -> VaultResult<RenewalPolicy> {
        let policy = RenewalPolicy {
            task_token_ttl: parse_field("task_token_ttl", &self.task_token_ttl)?,
            connection_retry_interval: parse_field(
                "connection_retry_interval",
                &self.connection_retry_interval,
            )?,
            renewal_fraction: self.renewal_fraction,
            min_renewal_interval: parse_field("min_renewal_interval", &self.min_renewal_interval)?,
            stop_timeout: parse_field("stop_timeout", &self.stop_timeout)?,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn request_timeout(&self) -> VaultResult<Duration> {
        parse_field("request_timeout", &self.request_timeout)
    }
}

/// Longest grant a renewal delay is computed from (Vault's default max TTL).
pub const MAX_GRANT: Duration = Duration::from_secs(768 * 3600);

/// Resolved timing parameters the renewal loop runs with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalPolicy {
    pub task_token_ttl: Duration,
    pub connection_retry_interval: Duration,
    pub renewal_fraction: f64,
    pub min_renewal_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        // The defaults are known-good strings.
        VaultConfig::default()
            .policy()
            .unwrap_or(Self {
                task_token_ttl: Duration::from_secs(72 * 3600),
                connection_retry_interval: Duration::from_secs(30),
                renewal_fraction: 0.5,
                min_renewal_interval: Duration::from_secs(1),
                stop_timeout: Duration::from_secs(15),
            })
    }
}

impl RenewalPolicy {
    pub fn validate(&self) -> VaultResult<()> {
        if !(self.renewal_fraction > 0.0 && self.renewal_fraction < 1.0) {
            return Err(VaultError::Config(format!(
                "renewal_fraction must be in (0, 1), got {}",
                self.renewal_fraction
            )));
        }
        if self.connection_retry_interval.is_zero() {
            return Err(VaultError::Config(
                "connection_retry_interval must be non-zero".to_string(),
            ));
        }
        if self.task_token_ttl.as_secs() == 0 {
            return Err(VaultError::Config(
                "task_token_ttl must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay until the next renewal of a lease Vault just granted for
    /// `granted`. Grants beyond [`MAX_GRANT`] are treated as `MAX_GRANT`.
    pub fn renewal_delay(&self, granted: Duration) -> Duration {
        granted
            .min(MAX_GRANT)
            .mul_f64(self.renewal_fraction)
            .max(self.min_renewal_interval)
    }

    /// Increment to request, substituting the task token TTL for zero.
    pub fn increment_secs(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.task_token_ttl.as_secs()
        } else {
            requested
        }
    }
}

fn parse_field(name: &str, value: &str) -> VaultResult<Duration> {
    parse_duration(value)
        .ok_or_else(|| VaultError::Config(format!("{name}: invalid duration {value:?}")))
}

/// Parse a duration string like "500ms", "5s", "2m", "72h" or "10".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_resolve() {
        let policy = VaultConfig::default().policy().unwrap();
        assert_eq!(policy.task_token_ttl, Duration::from_secs(72 * 3600));
        assert_eq!(policy.connection_retry_interval, Duration::from_secs(30));
        assert_eq!(policy.renewal_fraction, 0.5);
        assert_eq!(policy, RenewalPolicy::default());
    }

    #[test]
    fn parse_nested_vault_table() {
        let config = VaultConfig::from_toml_str(
            r#"
[vault]
enabled = true
address = "http://vault.service:8200"
token = "s.agent"
connection_retry_interval = "100ms"
task_token_ttl = "4s"
"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.address, "http://vault.service:8200");
        assert_eq!(config.token.as_deref(), Some("s.agent"));

        let policy = config.policy().unwrap();
        assert_eq!(policy.connection_retry_interval, Duration::from_millis(100));
        assert_eq!(policy.task_token_ttl, Duration::from_secs(4));
        // Unset keys keep their defaults.
        assert_eq!(config.request_timeout().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn parse_top_level_keys() {
        let config = VaultConfig::from_toml_str("enabled = true\nrenewal_fraction = 0.25\n").unwrap();
        assert!(config.enabled);
        assert_eq!(config.renewal_fraction, 0.25);
    }

    #[test]
    fn invalid_fraction_rejected() {
        for fraction in ["0.0", "1.0", "1.5", "-0.1"] {
            let toml_str = format!("renewal_fraction = {fraction}\n");
            assert!(matches!(
                VaultConfig::from_toml_str(&toml_str),
                Err(VaultError::Config(_))
            ));
        }
    }

    #[test]
    fn invalid_duration_rejected() {
        let err = VaultConfig::from_toml_str("connection_retry_interval = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("connection_retry_interval"));

        let err = VaultConfig::from_toml_str("connection_retry_interval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vault]\nenabled = true\nstop_timeout = \"2s\"").unwrap();

        let config = VaultConfig::from_file(file.path()).unwrap();
        assert!(config.enabled);
        assert_eq!(config.policy().unwrap().stop_timeout, Duration::from_secs(2));
    }

    #[test]
    fn from_file_missing_is_config_error() {
        let err = VaultConfig::from_file(Path::new("/nonexistent/vault.toml")).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn renewal_delay_uses_fraction_and_floor() {
        let policy = RenewalPolicy {
            min_renewal_interval: Duration::from_secs(1),
            ..RenewalPolicy::default()
        };
        assert_eq!(policy.renewal_delay(Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(policy.renewal_delay(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(policy.renewal_delay(Duration::ZERO), Duration::from_secs(1));

        let quarter = RenewalPolicy {
            renewal_fraction: 0.25,
            ..policy
        };
        assert_eq!(quarter.renewal_delay(Duration::from_secs(40)), Duration::from_secs(10));
    }

    #[test]
    fn renewal_delay_caps_huge_grants() {
        let policy = RenewalPolicy::default();
        assert_eq!(policy.renewal_delay(Duration::from_secs(u64::MAX)), MAX_GRANT / 2);
        assert_eq!(policy.renewal_delay(Duration::MAX), MAX_GRANT / 2);

        let near_one = RenewalPolicy {
            renewal_fraction: 0.999_999,
            ..policy
        };
        assert!(near_one.renewal_delay(Duration::MAX) < MAX_GRANT);
    }

    #[test]
    fn zero_increment_uses_task_token_ttl() {
        let policy = RenewalPolicy::default();
        assert_eq!(policy.increment_secs(0), 72 * 3600);
        assert_eq!(policy.increment_secs(15), 15);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("72h"), Some(Duration::from_secs(72 * 3600)));
        assert_eq!(parse_duration(" 10 "), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX / 60 + 1)), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX)), None);
        assert_eq!(parse_duration(""), None);
    }
}
