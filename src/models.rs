use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Code,
    Console,
}

impl Mode {
    pub fn as_label(self) -> &'static str {
        match self {
            Mode::Code => "code",
            Mode::Console => "console",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "code" => Some(Mode::Code),
            "console" => Some(Mode::Console),
            _ => None,
        }
    }
}

/// One quota window from the OAuth usage endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    #[serde(default)]
    pub utilization: f64,
    #[serde(default)]
    pub resets_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraUsage {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub monthly_limit: Option<f64>,
    #[serde(default)]
    pub used_credits: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageData {
    #[serde(default)]
    pub five_hour: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day_sonnet: Option<UsageWindow>,
    #[serde(default)]
    pub seven_day_opus: Option<UsageWindow>,
    #[serde(default)]
    pub extra_usage: Option<ExtraUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileAccount {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub has_claude_pro: bool,
    #[serde(default)]
    pub has_claude_max: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOrganization {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub organization_type: Option<String>,
    #[serde(default)]
    pub rate_limit_tier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub account: ProfileAccount,
    #[serde(default)]
    pub organization: ProfileOrganization,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub period_label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub by_model: BTreeMap<String, ModelTokens>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCost {
    pub email: String,
    pub cost_usd: f64,
}

/// Code variant observation written to `usage_snapshots`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageObservation {
    pub credits_used: Option<i64>,
    pub utilization_percent: Option<f64>,
    pub resets_at: Option<String>,
}

impl UsageObservation {
    pub fn from_usage(usage: &UsageData) -> Self {
        let five_hour = usage.five_hour.as_ref();
        Self {
            credits_used: usage
                .extra_usage
                .as_ref()
                .and_then(|extra| extra.used_credits)
                .map(|credits| credits.round() as i64),
            utilization_percent: five_hour.map(|w| w.utilization),
            resets_at: five_hour.and_then(|w| w.resets_at.clone()),
        }
    }
}

/// Console variant observation written to `console_usage_snapshots`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostObservation {
    pub mtd_cost: Option<f64>,
}

/// Extrapolation of a rate to a boundary. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub current_value: f64,
    pub projected_value: f64,
    pub rate_per_hour: f64,
    pub hours_until_boundary: f64,
}

impl Projection {
    pub fn increase(&self) -> f64 {
        self.projected_value - self.current_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_data_tolerates_missing_windows() {
        let usage: UsageData = serde_json::from_value(json!({
            "five_hour": { "utilization": 42.0, "resets_at": "2025-01-01T05:00:00+00:00" },
            "seven_day": null
        }))
        .expect("parse usage");
        assert_eq!(usage.five_hour.as_ref().map(|w| w.utilization), Some(42.0));
        assert!(usage.seven_day.is_none());
        assert!(usage.extra_usage.is_none());
    }

    #[test]
    fn observation_takes_credits_from_extra_usage() {
        let usage: UsageData = serde_json::from_value(json!({
            "five_hour": { "utilization": 10.5, "resets_at": "2025-01-01T05:00:00Z" },
            "extra_usage": { "is_enabled": true, "used_credits": 199.6 }
        }))
        .expect("parse usage");
        let obs = UsageObservation::from_usage(&usage);
        assert_eq!(obs.credits_used, Some(200));
        assert_eq!(obs.utilization_percent, Some(10.5));
        assert_eq!(obs.resets_at.as_deref(), Some("2025-01-01T05:00:00Z"));
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!(Mode::parse(" Console "), Some(Mode::Console));
        assert_eq!(Mode::parse("CODE"), Some(Mode::Code));
        assert_eq!(Mode::parse("web"), None);
    }
}
