// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;
use tracing::{debug, warn};

/// Tunables of the presentation scheduler and its backends
#[derive(Debug, Clone, PartialEq)]
pub struct PresentConfig {
    /// How long a frame callback may stay outstanding before the bridge advances the MSC itself
    pub fallback_interval: Duration,
    /// MSC rate of the bridge while requests wait and no frame callback is outstanding
    pub copy_interval: Duration,
    /// Period of the emulated clock used for windows without a backend clock
    pub fake_interval: Duration,
    pub allow_flips: bool,
    /// Live requests allowed per window
    pub max_requests: usize,
    /// Frames the simulation session submits before stopping
    pub demo_frames: u32,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            fallback_interval: hz_to_interval(15),
            copy_interval: hz_to_interval(60),
            fake_interval: Duration::from_micros(16_667),
            allow_flips: true,
            max_requests: 256,
            demo_frames: 120,
        }
    }
}

fn hz_to_interval(hz: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(hz.max(1)))
}

fn parse_positive<T: std::str::FromStr + PartialOrd + Default>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Some(parsed),
        _ => {
            warn!("Ignoring invalid value {:?} for {}", value, key);
            None
        }
    }
}

impl PresentConfig {
    /// Defaults overlaid with the `XPRESENT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            config.apply(key.as_ref(), value.as_ref());
        }
        debug!("Present config: {:?}", config);
        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "XPRESENT_FALLBACK_HZ" => {
                if let Some(hz) = parse_positive::<u32>(key, value) {
                    self.fallback_interval = hz_to_interval(hz);
                }
            }
            "XPRESENT_COPY_HZ" => {
                if let Some(hz) = parse_positive::<u32>(key, value) {
                    self.copy_interval = hz_to_interval(hz);
                }
            }
            "XPRESENT_FAKE_INTERVAL_US" => {
                if let Some(us) = parse_positive::<u64>(key, value) {
                    self.fake_interval = Duration::from_micros(us);
                }
            }
            "XPRESENT_NO_FLIP" => match value.trim() {
                "1" | "true" | "yes" => self.allow_flips = false,
                "0" | "false" | "no" | "" => self.allow_flips = true,
                _ => warn!("Ignoring invalid value {:?} for {}", value, key),
            },
            "XPRESENT_MAX_REQUESTS" => {
                if let Some(max) = parse_positive::<usize>(key, value) {
                    self.max_requests = max;
                }
            }
            "XPRESENT_DEMO_FRAMES" => {
                if let Some(frames) = parse_positive::<u32>(key, value) {
                    self.demo_frames = frames;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PresentConfig::from_vars(Vec::<(String, String)>::new());
        assert_eq!(config.fallback_interval, Duration::from_nanos(66_666_666));
        assert_eq!(config.copy_interval, Duration::from_nanos(16_666_666));
        assert!(config.allow_flips);
        assert_eq!(config.max_requests, 256);
    }

    #[test]
    fn overlay_from_vars() {
        let config = PresentConfig::from_vars([
            ("XPRESENT_FALLBACK_HZ", "10"),
            ("XPRESENT_NO_FLIP", "1"),
            ("XPRESENT_MAX_REQUESTS", "4"),
            ("XPRESENT_FAKE_INTERVAL_US", "1000"),
            ("UNRELATED", "x"),
        ]);
        assert_eq!(config.fallback_interval, Duration::from_millis(100));
        assert!(!config.allow_flips);
        assert_eq!(config.max_requests, 4);
        assert_eq!(config.fake_interval, Duration::from_millis(1));
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = PresentConfig::from_vars([
            ("XPRESENT_COPY_HZ", "0"),
            ("XPRESENT_MAX_REQUESTS", "lots"),
            ("XPRESENT_NO_FLIP", "maybe"),
        ]);
        assert_eq!(config, PresentConfig::default());
    }
}
