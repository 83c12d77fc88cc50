use std::collections::HashSet;

use llmrelay_affinity::AffinityCache;
use llmrelay_common::Kind;
use llmrelay_config::{ChannelStatus, ConfigManager, UpstreamConfig};
use llmrelay_metrics::MetricsManager;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    Exhausted,
}

pub struct Selection {
    pub index: usize,
    pub channel: UpstreamConfig,
}

/// §4.F: promotion override (health bypassed) → trace affinity (if
/// healthy) → ascending-priority active-channel walk → fallback to the
/// lowest channel-aggregate failure rate → exhaustion.
pub fn select_channel(
    config: &ConfigManager,
    metrics: &MetricsManager,
    affinity: &AffinityCache,
    kind: Kind,
    user_id: &str,
    model: &str,
    failed_channels: &HashSet<usize>,
) -> Result<Selection, SchedulerError> {
    let channels = config.snapshot();

    if let Some((index, channel)) = promoted_candidate(&channels, failed_channels) {
        return Ok(Selection { index, channel });
    }

    if !user_id.is_empty() {
        if let Some(index) = affinity.get_preferred_channel(kind, user_id) {
            if let Some(channel) = channels.get(index) {
                if channel.status == ChannelStatus::Active
                    && !failed_channels.contains(&index)
                    && channel.supports_model(model)
                    && metrics.is_healthy_with_keys(&active_key_pairs(channel))
                {
                    return Ok(Selection { index, channel: channel.clone() });
                }
            }
        }
    }

    let mut ordered: Vec<usize> = (0..channels.len()).collect();
    ordered.sort_by_key(|&i| priority_of(&channels[i], i));

    for &index in &ordered {
        let channel = &channels[index];
        if failed_channels.contains(&index) {
            continue;
        }
        if channel.status != ChannelStatus::Active || channel.api_keys.is_empty() {
            continue;
        }
        if !channel.supports_model(model) {
            continue;
        }
        if !metrics.is_healthy_with_keys(&active_key_pairs(channel)) {
            continue;
        }
        return Ok(Selection { index, channel: channel.clone() });
    }

    // §3: a disabled channel never participates; a suspended one
    // participates only here, as a last-resort fallback.
    let mut best: Option<(usize, f64)> = None;
    for &index in &ordered {
        let channel = &channels[index];
        if failed_channels.contains(&index)
            || channel.status == ChannelStatus::Disabled
            || channel.api_keys.is_empty()
            || !channel.supports_model(model)
        {
            continue;
        }
        let rate = metrics.channel_failure_rate(&all_key_pairs(channel)).unwrap_or(0.0);
        if best.map(|(_, best_rate)| rate < best_rate).unwrap_or(true) {
            best = Some((index, rate));
        }
    }
    if let Some((index, rate)) = best {
        info!(kind = %kind, index, rate, "degraded channel selection: no healthy candidate survived priority order");
        return Ok(Selection { index, channel: channels[index].clone() });
    }

    Err(SchedulerError::Exhausted)
}

fn promoted_candidate(channels: &[UpstreamConfig], failed_channels: &HashSet<usize>) -> Option<(usize, UpstreamConfig)> {
    let now = OffsetDateTime::now_utc();
    channels.iter().enumerate().find_map(|(index, channel)| {
        let live = channel.promotion_until.map(|until| until > now).unwrap_or(false);
        if live
            && channel.status == ChannelStatus::Active
            && !channel.api_keys.is_empty()
            && !failed_channels.contains(&index)
        {
            Some((index, channel.clone()))
        } else {
            None
        }
    })
}

fn priority_of(channel: &UpstreamConfig, index: usize) -> u32 {
    if channel.priority == 0 {
        index as u32
    } else {
        channel.priority
    }
}

fn active_key_pairs(channel: &UpstreamConfig) -> Vec<(String, String)> {
    let urls = channel.all_base_urls();
    urls.iter()
        .flat_map(|url| channel.api_keys.iter().map(move |key| (url.clone(), key.clone())))
        .collect()
}

fn all_key_pairs(channel: &UpstreamConfig) -> Vec<(String, String)> {
    let urls = channel.all_base_urls();
    urls.iter()
        .flat_map(|url| {
            channel
                .api_keys
                .iter()
                .chain(channel.historical_api_keys.iter())
                .map(move |key| (url.clone(), key.clone()))
        })
        .collect()
}
