//! Configuration types for hosts and fleet operations

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetrun_exec::{Credentials, RetryPolicy, Target, shell_quote};

/// Stable identity of a fleet member (its hostname)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declarative description of one fleet member
///
/// This is the only part of a host that is persisted. Live sessions are
/// rebuilt from it on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Hostname, possibly fully qualified
    pub name: String,
    /// IP address or resolvable name used for SSH
    pub addr: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Roles assigned by the provisioning layer (mon, osd, client, ...)
    #[serde(default)]
    pub roles: Vec<String>,
    /// Non-privileged test user
    pub operator: Credentials,
    /// Root/admin user
    pub privileged: Credentials,
}

fn default_port() -> u16 {
    22
}

impl HostSpec {
    /// Create a spec on the default port with no roles
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        operator: Credentials,
        privileged: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            port: default_port(),
            roles: Vec::new(),
            operator,
            privileged,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> HostId {
        HostId(self.name.clone())
    }

    /// First DNS label of the hostname
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn target(&self) -> Target {
        Target::new(&self.addr).with_port(self.port)
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Kernel TCP keep-alive values pushed over the privileged session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpKeepalive {
    #[serde(default = "default_keepalive_time")]
    pub time: u32,
    #[serde(default = "default_keepalive_intvl")]
    pub intvl: u32,
    #[serde(default = "default_keepalive_probes")]
    pub probes: u32,
}

fn default_keepalive_time() -> u32 {
    120
}

fn default_keepalive_intvl() -> u32 {
    60
}

fn default_keepalive_probes() -> u32 {
    20
}

impl Default for TcpKeepalive {
    fn default() -> Self {
        Self {
            time: default_keepalive_time(),
            intvl: default_keepalive_intvl(),
            probes: default_keepalive_probes(),
        }
    }
}

impl TcpKeepalive {
    #[must_use]
    pub fn sysctl_command(&self) -> String {
        format!(
            "sysctl -w net.ipv4.tcp_keepalive_time={} net.ipv4.tcp_keepalive_intvl={} net.ipv4.tcp_keepalive_probes={}",
            self.time, self.intvl, self.probes
        )
    }
}

/// Connection and recovery settings shared by every host in a fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectSettings {
    /// Attempts per session before the host is marked failed
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between connection attempts
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    /// Bound on a single TCP connect plus handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// SSH transport keep-alive interval
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Delay between post-reboot reconnect polls
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: f64,
    /// How long to wait for a rebooting host to drop its session
    #[serde(default = "default_reboot_grace_secs")]
    pub reboot_grace_secs: f64,
    /// File whose presence marks an rpm-based host
    #[serde(default = "default_package_marker")]
    pub package_marker: String,
    #[serde(default)]
    pub tcp_keepalive: TcpKeepalive,
    /// Cap on concurrent fleet operations, unbounded when unset
    #[serde(default)]
    pub max_parallelism: Option<usize>,
}

fn default_connect_attempts() -> u32 {
    4
}

fn default_retry_delay_secs() -> f64 {
    10.0
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    15
}

fn default_reconnect_interval_secs() -> f64 {
    10.0
}

fn default_reboot_grace_secs() -> f64 {
    30.0
}

fn default_package_marker() -> String {
    "/etc/redhat-release".to_string()
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            reboot_grace_secs: default_reboot_grace_secs(),
            package_marker: default_package_marker(),
            tcp_keepalive: TcpKeepalive::default(),
            max_parallelism: None,
        }
    }
}

impl ConnectSettings {
    /// Retry policy for opening one session
    #[must_use]
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.connect_attempts, secs(self.retry_delay_secs))
    }

    /// Retry policy for polling a host back after a reboot
    #[must_use]
    pub fn reconnect_policy(&self, deadline: Duration) -> RetryPolicy {
        RetryPolicy::reconnect(deadline)
            .with_backoff(fleetrun_exec::Backoff::Fixed(secs(self.reconnect_interval_secs)))
    }

    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn reboot_grace(&self) -> Duration {
        secs(self.reboot_grace_secs)
    }

    #[must_use]
    pub fn package_probe_command(&self) -> String {
        format!("test -f {}", shell_quote(&self.package_marker))
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// Serializable description of a whole fleet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    #[serde(default)]
    pub settings: ConnectSettings,
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> HostSpec {
        HostSpec::new(
            name,
            "10.0.0.5",
            Credentials::password("cephuser", "cephuser"),
            Credentials::password("root", "passwd"),
        )
    }

    #[test]
    fn test_short_name() {
        assert_eq!(spec("ceph-node1.lab.example.com").short_name(), "ceph-node1");
        assert_eq!(spec("ceph-node2").short_name(), "ceph-node2");
    }

    #[test]
    fn test_default_settings() {
        let settings = ConnectSettings::default();
        let policy = settings.connect_policy();

        assert_eq!(policy.max_attempts, Some(4));
        assert_eq!(policy.backoff, fleetrun_exec::Backoff::Fixed(Duration::from_secs(10)));
        assert_eq!(settings.keepalive(), Duration::from_secs(15));
        assert_eq!(
            settings.tcp_keepalive.sysctl_command(),
            "sysctl -w net.ipv4.tcp_keepalive_time=120 net.ipv4.tcp_keepalive_intvl=60 net.ipv4.tcp_keepalive_probes=20"
        );
        assert_eq!(settings.package_probe_command(), "test -f '/etc/redhat-release'");
    }

    #[test]
    fn test_fleet_spec_json_roundtrip_keeps_declarative_fields() {
        let fleet = FleetSpec {
            settings: ConnectSettings::default(),
            hosts: vec![spec("ceph-mon1").with_role("mon")],
        };

        let json = serde_json::to_string(&fleet).unwrap();
        let parsed: FleetSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fleet);
        assert!(parsed.hosts[0].has_role("mon"));
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: ConnectSettings =
            serde_json::from_str(r#"{"connect_attempts": 2, "retry_delay_secs": 0.5}"#).unwrap();

        assert_eq!(settings.connect_attempts, 2);
        assert_eq!(settings.keepalive_secs, 15);
        assert_eq!(settings.tcp_keepalive.probes, 20);
    }
}
