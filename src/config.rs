use std::{fs, path::Path};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_url: Option<String>,
    pub log_level: Option<String>,
    pub redis_url: Option<String>,
    pub instance_id: Option<String>,
    pub is_master_node: Option<bool>,
    pub relay_timeout: Option<u64>,
    pub relay_response_timeout: Option<u64>,
    pub pre_consumed_quota: Option<i64>,
    pub batch_update_enabled: Option<bool>,
    pub batch_update_interval: Option<u64>,
    pub channel_test_interval: Option<u64>,
    pub leader_election: Option<LeaderElectionConfig>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct LeaderElectionConfig {
    pub enable: Option<bool>,
    pub lease_seconds: Option<u64>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(db_url) = self.db_url { final_config.db_url = db_url; }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(redis_url) = self.redis_url { final_config.redis_url = Some(redis_url); }
        if let Some(instance_id) = self.instance_id { final_config.instance_id = instance_id; }
        if let Some(is_master_node) = self.is_master_node { final_config.is_master_node = is_master_node; }
        if let Some(relay_timeout) = self.relay_timeout { final_config.relay_timeout = relay_timeout; }
        if let Some(relay_response_timeout) = self.relay_response_timeout { final_config.relay_response_timeout = relay_response_timeout; }
        if let Some(pre_consumed_quota) = self.pre_consumed_quota { final_config.pre_consumed_quota = pre_consumed_quota; }
        if let Some(batch_update_enabled) = self.batch_update_enabled { final_config.batch_update_enabled = batch_update_enabled; }
        if let Some(batch_update_interval) = self.batch_update_interval { final_config.batch_update_interval = batch_update_interval; }
        if let Some(channel_test_interval) = self.channel_test_interval { final_config.channel_test_interval = channel_test_interval; }
        if let Some(le) = self.leader_election {
            if let Some(enable) = le.enable { final_config.leader_election_enable = Some(enable); }
            if let Some(lease) = le.lease_seconds { final_config.leader_election_lease_seconds = lease; }
        }
    }
}

// The fully resolved configuration used by the application.
#[derive(Debug, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub db_url: String,
    pub log_level: String,
    pub redis_url: Option<String>,
    /// Identity used to tag published sync messages (self-origin suppression).
    pub instance_id: String,
    /// Static role when leader election is not running.
    pub is_master_node: bool,
    /// Global HTTP client timeout in seconds; 0 = unlimited.
    pub relay_timeout: u64,
    /// Response-header timeout for the racing client in seconds; floored at 5.
    pub relay_response_timeout: u64,
    /// Floor for preconsume when the request carries no max_tokens.
    pub pre_consumed_quota: i64,
    pub batch_update_enabled: bool,
    /// Flush interval for coalesced quota updates, in seconds.
    pub batch_update_interval: u64,
    /// Leader-gated channel health test interval in seconds; 0 = disabled.
    pub channel_test_interval: u64,
    pub leader_election_enable: Option<bool>,
    pub leader_election_lease_seconds: u64,
}

impl FinalConfig {
    pub fn redis_enabled(&self) -> bool {
        self.redis_url.is_some()
    }

    pub fn relay_response_timeout_secs(&self) -> u64 {
        self.relay_response_timeout.max(5)
    }
}

pub fn make_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_default();
    let host = if host.is_empty() { "unknown-host".to_string() } else { host };
    format!("{}-{}", host, Uuid::new_v4())
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        db_url: get_env_var("DB_URL"),
        log_level: get_env_var("LOG_LEVEL"),
        redis_url: get_env_var("REDIS_URL"),
        instance_id: get_env_var("INSTANCE_ID"),
        is_master_node: get_env_var("IS_MASTER_NODE"),
        relay_timeout: get_env_var("RELAY_TIMEOUT"),
        relay_response_timeout: get_env_var("RELAY_RESPONSE_TIMEOUT"),
        pre_consumed_quota: get_env_var("PRE_CONSUMED_QUOTA"),
        batch_update_enabled: get_env_var("BATCH_UPDATE_ENABLED"),
        batch_update_interval: get_env_var("BATCH_UPDATE_INTERVAL"),
        channel_test_interval: get_env_var("CHANNEL_TEST_INTERVAL"),
        leader_election: match (
            get_env_var("LEADER_ELECTION_ENABLE"),
            get_env_var("LEADER_ELECTION_LEASE_SECONDS"),
        ) {
            (None, None) => None,
            (enable, lease_seconds) => Some(LeaderElectionConfig { enable, lease_seconds }),
        },
    }
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let default_config_path = Path::new("config.default.yaml");
    let user_config_path = Path::new("config.yaml");

    let mut final_config = FinalConfig {
        host: "0.0.0.0".to_string(),
        port: 3000,
        db_url: "./storage/relay-hub.db".to_string(),
        log_level: "info".to_string(),
        redis_url: None,
        instance_id: make_node_id(),
        is_master_node: true,
        relay_timeout: 0,
        relay_response_timeout: 30,
        pre_consumed_quota: 500,
        batch_update_enabled: false,
        batch_update_interval: 5,
        channel_test_interval: 0,
        leader_election_enable: None,
        leader_election_lease_seconds: 15,
    };

    // Layer the default file, then the user file, then the environment.
    for path in [default_config_path, user_config_path] {
        if path.exists() {
            if let Ok(config_str) = fs::read_to_string(path) {
                let partial: PartialConfig = serde_yaml::from_str(&config_str)
                    .unwrap_or_else(|e| panic!("Failed to parse configuration file at {:?}: {}", path, e));
                partial.merge_into(&mut final_config);
            }
        }
    }
    get_config_from_env().merge_into(&mut final_config);

    final_config
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overrides_only_present_fields() {
        let mut base = FinalConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_url: "./db".to_string(),
            log_level: "info".to_string(),
            redis_url: None,
            instance_id: "node-a".to_string(),
            is_master_node: true,
            relay_timeout: 0,
            relay_response_timeout: 30,
            pre_consumed_quota: 500,
            batch_update_enabled: false,
            batch_update_interval: 5,
            channel_test_interval: 0,
            leader_election_enable: None,
            leader_election_lease_seconds: 15,
        };
        let partial: PartialConfig = serde_yaml::from_str(
            "port: 8080\nleader_election:\n  lease_seconds: 30\n",
        )
        .unwrap();
        partial.merge_into(&mut base);

        assert_eq!(base.port, 8080);
        assert_eq!(base.host, "0.0.0.0");
        assert_eq!(base.leader_election_lease_seconds, 30);
        assert_eq!(base.leader_election_enable, None);
    }

    #[test]
    fn test_response_timeout_floor() {
        let mut config: FinalConfig = serde_yaml::from_str(
            "host: 0.0.0.0\nport: 1\ndb_url: x\nlog_level: info\nredis_url: null\ninstance_id: i\nis_master_node: true\nrelay_timeout: 0\nrelay_response_timeout: 2\npre_consumed_quota: 500\nbatch_update_enabled: false\nbatch_update_interval: 5\nchannel_test_interval: 0\nleader_election_enable: null\nleader_election_lease_seconds: 15\n",
        )
        .unwrap();
        assert_eq!(config.relay_response_timeout_secs(), 5);
        config.relay_response_timeout = 60;
        assert_eq!(config.relay_response_timeout_secs(), 60);
    }

    #[test]
    fn test_node_id_shape() {
        let id = make_node_id();
        assert!(id.contains('-'));
        assert!(id.len() > 36);
    }
}
