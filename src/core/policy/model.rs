//! Typed policy entries.
//!
//! On the wire a policy carries a `type` discriminator next to a free-form
//! `config` object. The payload is decoded into the matching variant at the
//! serde boundary, so a [`PolicyEntry`] whose config disagrees with its type
//! cannot be deserialized.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyType {
    Cors,
    IpAllow,
    IpDeny,
    CachePolicy,
    RateLimitPolicy,
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyType::Cors => "cors",
            PolicyType::IpAllow => "ipAllow",
            PolicyType::IpDeny => "ipDeny",
            PolicyType::CachePolicy => "cachePolicy",
            PolicyType::RateLimitPolicy => "rateLimitPolicy",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cors" => Ok(PolicyType::Cors),
            "ipallow" => Ok(PolicyType::IpAllow),
            "ipdeny" => Ok(PolicyType::IpDeny),
            "cachepolicy" => Ok(PolicyType::CachePolicy),
            "ratelimitpolicy" => Ok(PolicyType::RateLimitPolicy),
            other => Err(format!("unknown policy type '{other}'")),
        }
    }
}

/// How a matching policy is acted upon. Ordered from weakest to strongest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PolicyMode {
    Shadow,
    AuditOnly,
    #[default]
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: Option<u32>,
}

/// Addresses or CIDR ranges; allow or deny depends on the policy type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpConfig {
    pub cidrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub vary_by_headers: Vec<String>,
    pub vary_by_query: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitPolicyConfig {
    pub permit_limit: i64,
    pub window_seconds: i64,
    pub queue_limit: i64,
}

/// Policy payload, one variant per config shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyConfig {
    Cors(CorsConfig),
    Ip(IpConfig),
    Cache(CacheConfig),
    RateLimit(RateLimitPolicyConfig),
}

impl PolicyConfig {
    /// Whether this payload is the shape required by `policy_type`.
    pub fn fits(&self, policy_type: PolicyType) -> bool {
        matches!(
            (policy_type, self),
            (PolicyType::Cors, PolicyConfig::Cors(_))
                | (PolicyType::IpAllow | PolicyType::IpDeny, PolicyConfig::Ip(_))
                | (PolicyType::CachePolicy, PolicyConfig::Cache(_))
                | (PolicyType::RateLimitPolicy, PolicyConfig::RateLimit(_))
        )
    }

    fn decode(policy_type: PolicyType, raw: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match policy_type {
            PolicyType::Cors => PolicyConfig::Cors(serde_json::from_value(raw)?),
            PolicyType::IpAllow | PolicyType::IpDeny => {
                PolicyConfig::Ip(serde_json::from_value(raw)?)
            }
            PolicyType::CachePolicy => PolicyConfig::Cache(serde_json::from_value(raw)?),
            PolicyType::RateLimitPolicy => PolicyConfig::RateLimit(serde_json::from_value(raw)?),
        })
    }

    fn encode(&self) -> serde_json::Value {
        let encoded = match self {
            PolicyConfig::Cors(c) => serde_json::to_value(c),
            PolicyConfig::Ip(c) => serde_json::to_value(c),
            PolicyConfig::Cache(c) => serde_json::to_value(c),
            PolicyConfig::RateLimit(c) => serde_json::to_value(c),
        };
        encoded.unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyRecord", into = "PolicyRecord")]
pub struct PolicyEntry {
    pub id: String,
    pub policy_type: PolicyType,
    pub mode: PolicyMode,
    pub description: String,
    pub config: PolicyConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub enabled: bool,
}

impl PolicyEntry {
    /// A new enabled policy stamped with the current time.
    pub fn new(id: impl Into<String>, policy_type: PolicyType, config: PolicyConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            policy_type,
            mode: PolicyMode::default(),
            description: String::new(),
            config,
            created_at: now,
            updated_at: now,
            enabled: true,
        }
    }

    pub fn with_mode(mut self, mode: PolicyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Wire form of [`PolicyEntry`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRecord {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    policy_type: PolicyType,
    #[serde(default)]
    mode: PolicyMode,
    #[serde(default)]
    description: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TryFrom<PolicyRecord> for PolicyEntry {
    type Error = String;

    fn try_from(record: PolicyRecord) -> Result<Self, Self::Error> {
        let raw = match record.config {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let config = PolicyConfig::decode(record.policy_type, raw).map_err(|e| {
            format!(
                "config of policy '{}' is not a valid {} payload: {e}",
                record.id, record.policy_type
            )
        })?;
        Ok(PolicyEntry {
            id: record.id,
            policy_type: record.policy_type,
            mode: record.mode,
            description: record.description,
            config,
            created_at: record.created_at,
            updated_at: record.updated_at,
            enabled: record.enabled,
        })
    }
}

impl From<PolicyEntry> for PolicyRecord {
    fn from(entry: PolicyEntry) -> Self {
        PolicyRecord {
            config: entry.config.encode(),
            id: entry.id,
            policy_type: entry.policy_type,
            mode: entry.mode,
            description: entry.description,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            enabled: entry.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_decoded_by_type() {
        let json = r#"{
            "id": "block-scanners",
            "type": "ipDeny",
            "mode": "auditOnly",
            "config": { "cidrs": ["203.0.113.0/24"] }
        }"#;
        let entry: PolicyEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.policy_type, PolicyType::IpDeny);
        assert_eq!(entry.mode, PolicyMode::AuditOnly);
        assert!(entry.enabled);
        assert_eq!(
            entry.config,
            PolicyConfig::Ip(IpConfig {
                cidrs: vec!["203.0.113.0/24".to_string()]
            })
        );
    }

    #[test]
    fn test_mismatched_config_is_rejected() {
        let json = r#"{
            "id": "cors",
            "type": "cors",
            "config": { "allowedOrigins": "not-a-list" }
        }"#;
        let err = serde_json::from_str::<PolicyEntry>(json).unwrap_err();
        assert!(err.to_string().contains("not a valid cors payload"));
    }

    #[test]
    fn test_wire_form_uses_type_field() {
        let entry = PolicyEntry::new(
            "limits",
            PolicyType::RateLimitPolicy,
            PolicyConfig::RateLimit(RateLimitPolicyConfig {
                permit_limit: 10,
                window_seconds: 60,
                queue_limit: 0,
            }),
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "rateLimitPolicy");
        assert_eq!(value["config"]["windowSeconds"], 60);

        let back: PolicyEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_mode_ordering() {
        assert!(PolicyMode::Shadow < PolicyMode::AuditOnly);
        assert!(PolicyMode::AuditOnly < PolicyMode::Enforce);
        assert!("IPALLOW".parse::<PolicyType>().is_ok());
        assert!(
            PolicyConfig::Ip(IpConfig::default()).fits(PolicyType::IpDeny)
                && !PolicyConfig::Ip(IpConfig::default()).fits(PolicyType::Cors)
        );
    }
}
