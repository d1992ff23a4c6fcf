use std::time::Duration;

pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const MIN_BOOTSTRAP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SERVER_CHECK_PERIOD: Duration = Duration::from_secs(3);

pub const ENV_BOOTSTRAP_TIMEOUT_SECS: &str = "DEVBOX_BOOTSTRAP_TIMEOUT_SECS";
pub const ENV_INSTALLER_TIMEOUT_SECS: &str = "DEVBOX_INSTALLER_TIMEOUT_SECS";
pub const ENV_INSTALLER_MANIFEST_PATH: &str = "DEVBOX_INSTALLER_MANIFEST_PATH";
pub const ENV_SERVER_CHECK_PERIOD_SECS: &str = "DEVBOX_SERVER_CHECK_PERIOD_SECS";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapConfig {
    /// How long `bootstrap()` waits for the terminal event.
    pub timeout: Duration,
    /// Optional ceiling for a single agent's script. Server installers fall
    /// back to `timeout` when unset.
    pub installer_timeout: Option<Duration>,
    /// Absolute path inside the machine that receives the agent list as JSON
    /// before the first agent runs.
    pub manifest_path: Option<String>,
    /// Pause between two checks of a server installer's ports.
    pub server_check_period: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            installer_timeout: None,
            manifest_path: None,
            server_check_period: DEFAULT_SERVER_CHECK_PERIOD,
        }
    }
}

impl BootstrapConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to the defaults; the overall ceiling
    /// never drops below ten seconds.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let secs = |key: &str| value(key).and_then(|raw| raw.parse::<u64>().ok());

        let mut config = Self {
            installer_timeout: secs(ENV_INSTALLER_TIMEOUT_SECS)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            manifest_path: value(ENV_INSTALLER_MANIFEST_PATH),
            server_check_period: secs(ENV_SERVER_CHECK_PERIOD_SECS)
                .filter(|secs| *secs > 0)
                .map_or(DEFAULT_SERVER_CHECK_PERIOD, Duration::from_secs),
            ..Self::default()
        };
        if let Some(secs) = secs(ENV_BOOTSTRAP_TIMEOUT_SECS) {
            config.set_timeout_secs(secs);
        }
        config
    }

    /// Sets the completion ceiling, raising it to
    /// [`MIN_BOOTSTRAP_TIMEOUT_SECS`] if lower.
    pub fn set_timeout_secs(&mut self, secs: u64) {
        self.timeout = Duration::from_secs(secs.max(MIN_BOOTSTRAP_TIMEOUT_SECS));
    }
}
