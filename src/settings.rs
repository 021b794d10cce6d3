use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::speedtest::planner::{default_bands, AdaptivePlanner, BandSpec};
use crate::speedtest::{Result, SpeedTestError};

pub const DEFAULT_PING_URL: &str = "https://www.google.com/favicon.ico";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down";
pub const DEFAULT_UPLOAD_URL: &str = "https://speed.cloudflare.com/__up";

#[derive(Debug, Clone)]
pub struct Settings {
    pub ping_url: String,
    pub download_url: String,
    pub upload_url: String,

    pub ping_count: usize,
    /// Probes slower than this are treated as lost.
    pub ping_ceiling: Duration,

    pub calibration_bytes: u64,
    /// Estimate used when calibration fails.
    pub fallback_mbps: f64,

    pub stream_count: usize,
    pub bands: Vec<BandSpec>,

    pub settling_window: Duration,
    pub series_len: usize,

    pub stream_timeout: Duration,
    /// Hard wall-clock limit per direction; streams still running when it
    /// passes are stopped and counted as complete.
    pub transfer_cap: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_url: DEFAULT_PING_URL.to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            ping_count: 5,
            ping_ceiling: Duration::from_millis(1000),
            calibration_bytes: 2_000_000,
            fallback_mbps: 10.0,
            stream_count: 3,
            bands: default_bands(),
            settling_window: Duration::from_millis(200),
            series_len: 50,
            stream_timeout: Duration::from_secs(60),
            transfer_cap: None,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `SPEEDGAUGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `SPEEDGAUGE_*` name.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(url) = lookup("SPEEDGAUGE_PING_URL") {
            settings.ping_url = url;
        }
        if let Some(url) = lookup("SPEEDGAUGE_DOWNLOAD_URL") {
            settings.download_url = url;
        }
        if let Some(url) = lookup("SPEEDGAUGE_UPLOAD_URL") {
            settings.upload_url = url;
        }
        if let Some(streams) = parse_var(&lookup, "SPEEDGAUGE_STREAMS")? {
            settings.stream_count = streams;
        }
        if let Some(count) = parse_var(&lookup, "SPEEDGAUGE_PING_COUNT")? {
            settings.ping_count = count;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SPEEDGAUGE_TRANSFER_CAP_SECS")? {
            settings.transfer_cap = (secs > 0).then(|| Duration::from_secs(secs));
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_count == 0 {
            return Err(SpeedTestError::InvalidConfig("ping count must be at least 1".into()));
        }
        if self.calibration_bytes == 0 {
            return Err(SpeedTestError::InvalidConfig("calibration size must be positive".into()));
        }
        if self.series_len == 0 {
            return Err(SpeedTestError::InvalidConfig("rate series needs at least one slot".into()));
        }
        self.planner().map(|_| ())
    }

    pub fn planner(&self) -> Result<AdaptivePlanner> {
        AdaptivePlanner::new(self.bands.clone(), self.stream_count)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SpeedTestError::InvalidConfig(format!("{name}={raw:?} is not a valid value"))),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    PingCount,
    StreamCount,
    TransferCap,
}

impl SettingsField {
    pub fn next(self) -> Self {
        match self {
            SettingsField::PingCount => SettingsField::StreamCount,
            SettingsField::StreamCount => SettingsField::TransferCap,
            SettingsField::TransferCap => SettingsField::PingCount,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            SettingsField::PingCount => SettingsField::TransferCap,
            SettingsField::StreamCount => SettingsField::PingCount,
            SettingsField::TransferCap => SettingsField::StreamCount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Mutex, MutexGuard};
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    /// Serializes tests that touch the process environment and removes
    /// whatever they set on drop.
    struct EnvGuard {
        names: Vec<&'static str>,
        _lock: MutexGuard<'static, ()>,
    }

    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    impl EnvGuard {
        fn set(pairs: &[(&'static str, &str)]) -> Self {
            let lock = ENV_LOCK.lock();
            for (name, value) in pairs {
                env::set_var(name, value);
            }
            Self {
                names: pairs.iter().map(|(name, _)| *name).collect(),
                _lock: lock,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for name in &self.names {
                env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_overrides_applied() {
        let settings = Settings::from_vars(vars(&[
            ("SPEEDGAUGE_UPLOAD_URL", "http://localhost:3000/upload"),
            ("SPEEDGAUGE_STREAMS", " 5 "),
            ("SPEEDGAUGE_PING_COUNT", "8"),
            ("SPEEDGAUGE_TRANSFER_CAP_SECS", "10"),
        ]))
        .unwrap();

        assert_eq!(settings.upload_url, "http://localhost:3000/upload");
        assert_eq!(settings.download_url, DEFAULT_DOWNLOAD_URL);
        assert_eq!(settings.stream_count, 5);
        assert_eq!(settings.ping_count, 8);
        assert_eq!(settings.transfer_cap, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_transfer_cap_turns_it_off() {
        let settings = Settings::from_vars(vars(&[("SPEEDGAUGE_TRANSFER_CAP_SECS", "0")])).unwrap();
        assert_eq!(settings.transfer_cap, None);
    }

    #[test]
    fn test_unparsable_value_is_invalid_config() {
        let err = Settings::from_vars(vars(&[("SPEEDGAUGE_STREAMS", "three")])).unwrap_err();
        match err {
            SpeedTestError::InvalidConfig(msg) => assert!(msg.contains("SPEEDGAUGE_STREAMS"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        let err = Settings::from_vars(vars(&[("SPEEDGAUGE_TRANSFER_CAP_SECS", "-1")])).unwrap_err();
        assert!(matches!(err, SpeedTestError::InvalidConfig(_)));
    }

    #[test]
    fn test_parsed_values_are_validated() {
        let err = Settings::from_vars(vars(&[("SPEEDGAUGE_PING_COUNT", "0")])).unwrap_err();
        assert!(matches!(err, SpeedTestError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        let guard = EnvGuard::set(&[
            ("SPEEDGAUGE_STREAMS", "4"),
            ("SPEEDGAUGE_TRANSFER_CAP_SECS", "0"),
        ]);
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.stream_count, 4);
        assert_eq!(settings.transfer_cap, None);
        drop(guard);

        let _guard = EnvGuard::set(&[("SPEEDGAUGE_PING_COUNT", "many")]);
        assert!(matches!(Settings::from_env(), Err(SpeedTestError::InvalidConfig(_))));
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.stream_count, 3);
        assert_eq!(settings.ping_count, 5);
        assert_eq!(settings.transfer_cap, None);
    }

    #[test]
    fn test_zero_streams_rejected() {
        let settings = Settings {
            stream_count: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(SpeedTestError::InvalidConfig(_))));
    }

    #[test]
    fn test_field_cycle() {
        let mut field = SettingsField::PingCount;
        for _ in 0..3 {
            field = field.next();
        }
        assert_eq!(field, SettingsField::PingCount);
        assert_eq!(SettingsField::PingCount.prev(), SettingsField::TransferCap);
    }
}
