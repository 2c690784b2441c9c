// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::{Ini, Properties};
use log::{debug, info, warn};
use nvhost_common::settings::{ChannelDesc, HostConfig};
use std::path::Path;
use std::str::FromStr;

/// Everything the runner reads from its INI file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: HostConfig,
    /// Watchdog for each workload context. 0 disables it.
    pub submit_timeout_ms: u32,
    /// How long the runner waits for the last fence.
    pub wait_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            submit_timeout_ms: 100,
            wait_timeout_ms: 10_000,
        }
    }
}

/// Load settings from `path`, or defaults if there is none.
pub fn load_config(path: Option<&Path>) -> Settings {
    let Some(path) = path else {
        info!("No config given, using defaults");
        return Settings::default();
    };
    if !path.exists() {
        warn!("Config file not found: {}", path.display());
        return Settings::default();
    }

    info!("Loading config from: {}", path.display());
    match Ini::load_from_file(path) {
        Ok(conf) => from_ini(&conf),
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            Settings::default()
        }
    }
}

pub fn from_ini(conf: &Ini) -> Settings {
    let mut settings = Settings::default();
    let host = &mut settings.host;

    // [Host]
    if let Some(section) = conf.section(Some("Host")) {
        host.num_syncpts = get(section, "num_syncpts", host.num_syncpts);
        host.num_wait_bases = get(section, "num_wait_bases", host.num_wait_bases);
        host.num_mlocks = get(section, "num_mlocks", host.num_mlocks);
        host.push_buffer_size = get(section, "push_buffer_size", host.push_buffer_size);
        host.sync_queue_words = get(section, "sync_queue_words", host.sync_queue_words);
        host.replay_incrs_per_slot =
            get(section, "replay_incrs_per_slot", host.replay_incrs_per_slot);
        if let Some(list) = section.get("client_managed") {
            match parse_list(list) {
                Some(ids) => host.client_managed = ids,
                None => warn!("Bad client_managed list: {}", list),
            }
        }
    }

    // [Timeouts]
    if let Some(section) = conf.section(Some("Timeouts")) {
        host.syncpt_check_period_ms =
            get(section, "syncpt_check_period_ms", host.syncpt_check_period_ms);
        host.max_stuck_check_count =
            get(section, "max_stuck_check_count", host.max_stuck_check_count);
        host.fifo_poll_interval_us =
            get(section, "fifo_poll_interval_us", host.fifo_poll_interval_us);
        host.fifo_drain_timeout_ms =
            get(section, "fifo_drain_timeout_ms", host.fifo_drain_timeout_ms);
        host.irq_poll_period_ms = get(section, "irq_poll_period_ms", host.irq_poll_period_ms);
        settings.submit_timeout_ms =
            get(section, "submit_timeout_ms", settings.submit_timeout_ms);
        settings.wait_timeout_ms = get(section, "wait_timeout_ms", settings.wait_timeout_ms);
    }

    // [Channel.N], replacing the default table when present.
    let mut channels: Vec<(u32, ChannelDesc)> = conf
        .iter()
        .filter_map(|(name, section)| {
            let idx = name?.strip_prefix("Channel.")?;
            let Ok(idx) = idx.trim().parse::<u32>() else {
                warn!("Ignoring section [{}]", name.unwrap_or_default());
                return None;
            };
            channel(idx, section).map(|desc| (idx, desc))
        })
        .collect();
    if !channels.is_empty() {
        channels.sort_by_key(|(idx, _)| *idx);
        settings.host.channels = channels.into_iter().map(|(_, desc)| desc).collect();
    }

    if let Err(e) = settings.host.validate() {
        warn!("{}, using default host configuration", e);
        settings.host = HostConfig::default();
    }
    debug!("Host config: {:?}", settings.host);
    settings
}

fn channel(idx: u32, section: &Properties) -> Option<ChannelDesc> {
    let Some(syncpt) = section.get("syncpt").and_then(|v| v.trim().parse().ok()) else {
        warn!("[Channel.{}] has no valid syncpt, ignored", idx);
        return None;
    };
    let name = section.get("name").unwrap_or("unit").trim();
    let wait_base = section.get("wait_base").and_then(|v| match v.trim() {
        "" | "none" => None,
        v => v.parse().ok(),
    });
    let class_id = section
        .get("class")
        .and_then(|v| parse_u32(v.trim()))
        .unwrap_or(0);
    Some(ChannelDesc::new(name, syncpt, wait_base, class_id))
}

fn get<T: FromStr + Copy>(section: &Properties, key: &str, current: T) -> T {
    match section.get(key) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!("Bad value for {}: {}", key, v);
            current
        }),
        None => current,
    }
}

/// Decimal or `0x` hex.
fn parse_u32(v: &str) -> Option<u32> {
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}

fn parse_list(v: &str) -> Option<Vec<u32>> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let conf = Ini::load_from_str(
            "[Host]\n\
             push_buffer_size = 1024\n\
             client_managed = 20, 21\n\
             [Timeouts]\n\
             submit_timeout_ms = 250\n\
             irq_poll_period_ms = 2\n",
        )
        .unwrap();
        let settings = from_ini(&conf);
        assert_eq!(settings.host.push_buffer_size, 1024);
        assert_eq!(settings.host.client_managed, vec![20, 21]);
        assert_eq!(settings.host.irq_poll_period_ms, 2);
        assert_eq!(settings.submit_timeout_ms, 250);
        assert_eq!(settings.host.channels.len(), 4);
    }

    #[test]
    fn test_channel_table_replaced_in_index_order() {
        let conf = Ini::load_from_str(
            "[Channel.1]\n\
             name = gr2d\n\
             syncpt = 18\n\
             wait_base = 0\n\
             class = 0x51\n\
             [Channel.0]\n\
             name = gr3d\n\
             syncpt = 22\n\
             wait_base = none\n\
             class = 96\n",
        )
        .unwrap();
        let host = from_ini(&conf).host;
        assert_eq!(host.channels.len(), 2);
        assert_eq!(host.channels[0].name, "gr3d");
        assert_eq!(host.channels[0].wait_base, None);
        assert_eq!(host.channels[0].class_id, 0x60);
        assert_eq!(host.channels[1].syncpt, 18);
        assert_eq!(host.channels[1].wait_base, Some(0));
        assert_eq!(host.channels[1].class_id, 0x51);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let conf = Ini::load_from_str(
            "[Host]\n\
             num_syncpts = lots\n\
             [Timeouts]\n\
             submit_timeout_ms = -5\n",
        )
        .unwrap();
        let settings = from_ini(&conf);
        assert_eq!(settings.host.num_syncpts, 32);
        assert_eq!(settings.submit_timeout_ms, 100);
    }

    #[test]
    fn test_invalid_geometry_falls_back() {
        let conf = Ini::load_from_str("[Host]\npush_buffer_size = 1000\n").unwrap();
        assert_eq!(
            from_ini(&conf).host.push_buffer_size,
            HostConfig::default().push_buffer_size
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = load_config(Some(Path::new("/nonexistent/nvhost.ini")));
        assert_eq!(settings.wait_timeout_ms, 10_000);
    }
}
