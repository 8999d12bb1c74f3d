//! Process configuration, read from the environment (and `.env` when present).
//!
//! | variable | default |
//! |---|---|
//! | `FIELDSTOCK_BIND_ADDR` | `0.0.0.0:8080` |
//! | `DATABASE_URL` | unset |
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `FIELDSTOCK_SLA_DAYS` | `5` |
//! | `FIELDSTOCK_TAX_RATE_BP` | `0` |
//! | `FIELDSTOCK_PO_PREFIX` | `PO-` |
//! | `FIELDSTOCK_PO_START` | `100` |
//! | `FIELDSTOCK_MAX_CONFLICT_RETRIES` | `3` |
//!
//! Unparsable values fall back to the default with a warning.

use std::net::SocketAddr;
use std::str::FromStr;

use fieldstock_core::TaxRate;
use fieldstock_infra::ProcurementSettings;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub procurement: ProcurementSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            use_persistent_stores: false,
            procurement: ProcurementSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if any), then read the process environment.
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "ignoring unreadable .env file");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let procurement_defaults = defaults.procurement.clone();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let use_persistent_stores = lookup("USE_PERSISTENT_STORES")
            .map(|raw| parse_flag(&raw))
            .unwrap_or(defaults.use_persistent_stores);

        let po_prefix = match lookup("FIELDSTOCK_PO_PREFIX") {
            Some(prefix) if !prefix.trim().is_empty() => prefix.trim().to_string(),
            Some(_) => {
                tracing::warn!(var = "FIELDSTOCK_PO_PREFIX", "empty value; using default");
                procurement_defaults.po_prefix.clone()
            }
            None => procurement_defaults.po_prefix.clone(),
        };

        Self {
            bind_addr: parsed(&lookup, "FIELDSTOCK_BIND_ADDR", defaults.bind_addr),
            database_url,
            use_persistent_stores,
            procurement: ProcurementSettings {
                sla_days: parsed(&lookup, "FIELDSTOCK_SLA_DAYS", procurement_defaults.sla_days),
                default_tax_rate: TaxRate::from_basis_points(parsed(
                    &lookup,
                    "FIELDSTOCK_TAX_RATE_BP",
                    procurement_defaults.default_tax_rate.basis_points(),
                )),
                po_prefix,
                po_start: parsed(&lookup, "FIELDSTOCK_PO_START", procurement_defaults.po_start),
                max_conflict_retries: parsed(
                    &lookup,
                    "FIELDSTOCK_MAX_CONFLICT_RETRIES",
                    procurement_defaults.max_conflict_retries,
                ),
            },
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> T
where
    T: FromStr + core::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(var = key, value = %raw, %default, "invalid value; using default");
            default
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), AppConfig::default());
        assert_eq!(AppConfig::default().bind_addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn values_are_read_from_the_environment() {
        let cfg = config(&[
            ("FIELDSTOCK_BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/fieldstock"),
            ("USE_PERSISTENT_STORES", "true"),
            ("FIELDSTOCK_SLA_DAYS", "3"),
            ("FIELDSTOCK_TAX_RATE_BP", "825"),
            ("FIELDSTOCK_PO_PREFIX", "FS-"),
            ("FIELDSTOCK_PO_START", "5000"),
            ("FIELDSTOCK_MAX_CONFLICT_RETRIES", "7"),
        ]);

        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/fieldstock"));
        assert!(cfg.use_persistent_stores);
        assert_eq!(cfg.procurement.sla_days, 3);
        assert_eq!(cfg.procurement.default_tax_rate.basis_points(), 825);
        assert_eq!(cfg.procurement.po_prefix, "FS-");
        assert_eq!(cfg.procurement.po_start, 5000);
        assert_eq!(cfg.procurement.max_conflict_retries, 7);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = config(&[
            ("FIELDSTOCK_BIND_ADDR", "not-an-address"),
            ("FIELDSTOCK_SLA_DAYS", "five"),
            ("FIELDSTOCK_TAX_RATE_BP", "-1"),
            ("FIELDSTOCK_PO_PREFIX", "  "),
            ("USE_PERSISTENT_STORES", "maybe"),
            ("DATABASE_URL", ""),
        ]);

        assert_eq!(cfg, AppConfig::default());
    }
}
