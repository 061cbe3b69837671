//! Two-stage model routing: name resolution, then channel selection under
//! weight, priority and health constraints.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rand::Rng;

use crate::adaptor::AdaptorRegistry;
use crate::cache::ModelSnapshot;
use crate::error::{ErrorKind, RelayError};
use crate::model::{Channel, Group};
use crate::relay::health::HealthRegistry;
use crate::relay::mode::Mode;

/// Stage A: requested name -> (origin, actual). The group's alias map wins;
/// the chosen channel's map is applied later by `RequestMeta::set_channel`.
pub fn resolve_model(requested: &str, group: &Group) -> (String, String) {
    let actual = group
        .model_mapping
        .get(requested)
        .cloned()
        .unwrap_or_else(|| requested.to_string());
    (requested.to_string(), actual)
}

/// Stage B: pick a channel for (mode, actual_model).
///
/// Candidates are enabled channels that support the mode, offer the model,
/// and share a model-set with the group. Within the highest priority the
/// pick is weighted-random; banned pairs are skipped and lower priorities
/// are only used when a whole partition is banned or excluded.
pub fn pick_channel(
    snapshot: &ModelSnapshot,
    registry: &AdaptorRegistry,
    health: &HealthRegistry,
    group: &Group,
    mode: Mode,
    actual_model: &str,
    exclude: &HashSet<i64>,
) -> Result<Arc<Channel>, RelayError> {
    let group_sets: HashSet<&str> = group.available_sets.iter().map(String::as_str).collect();

    let mut by_priority: BTreeMap<i32, Vec<Arc<Channel>>> = BTreeMap::new();
    for channel in &snapshot.channels {
        if !channel.is_enabled()
            || exclude.contains(&channel.id)
            || !channel.models.contains(actual_model)
            || !channel.sets.iter().any(|s| group_sets.contains(s.as_str()))
        {
            continue;
        }
        let supports = registry
            .get(channel.channel_type)
            .is_some_and(|a| a.supports_mode(mode));
        if !supports {
            continue;
        }
        by_priority.entry(channel.priority).or_default().push(channel.clone());
    }

    if by_priority.is_empty() {
        return Err(RelayError::new(
            ErrorKind::NoChannel,
            format!("no channel available for model {actual_model}"),
        ));
    }

    // Highest priority first; fall through when a partition is fully banned.
    for (_, mut partition) in by_priority.into_iter().rev() {
        partition.retain(|c| !health.is_banned(c.id, actual_model));
        if partition.is_empty() {
            continue;
        }
        return Ok(weighted_pick(partition));
    }

    Err(RelayError::new(
        ErrorKind::NoChannel,
        format!("all channels for model {actual_model} are cooling down"),
    ))
}

/// Weighted-random selection; ties and ordering are stable by channel id.
fn weighted_pick(mut candidates: Vec<Arc<Channel>>) -> Arc<Channel> {
    candidates.sort_by_key(|c| c.id);
    let total: u64 = candidates.iter().map(|c| effective_weight(c)).sum();
    let roll = rand::thread_rng().gen_range(0..total);
    pick_at(&candidates, roll)
}

/// Zero-weight channels still get a minimal share instead of starving.
fn effective_weight(channel: &Channel) -> u64 {
    u64::from(channel.weight.max(1))
}

fn pick_at(candidates: &[Arc<Channel>], mut roll: u64) -> Arc<Channel> {
    for candidate in candidates {
        let weight = effective_weight(candidate);
        if roll < weight {
            return candidate.clone();
        }
        roll -= weight;
    }
    // roll < sum(weights), so the loop always returns; this is unreachable
    // for any in-range roll.
    candidates[candidates.len() - 1].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::Utc;

    use crate::model::{ChannelStatus, ChannelType, GroupStatus};
    use crate::relay::health::BanPolicy;

    fn group_with_sets(sets: &[&str]) -> Group {
        Group {
            id: "acme".into(),
            status: GroupStatus::Enabled,
            rpm_ratio: 1.0,
            tpm_ratio: 1.0,
            available_sets: sets.iter().map(|s| s.to_string()).collect(),
            model_mapping: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn channel(id: i64, priority: i32, weight: u32, sets: &[&str]) -> Channel {
        Channel {
            id,
            channel_type: ChannelType::OpenAi,
            name: format!("ch-{id}"),
            key: "k".into(),
            base_url: None,
            priority,
            weight,
            status: ChannelStatus::Enabled,
            models: ["gpt-4o".to_string()].into_iter().collect(),
            model_mapping: HashMap::new(),
            sets: sets.iter().map(|s| s.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    fn snapshot_of(channels: Vec<Channel>) -> ModelSnapshot {
        ModelSnapshot {
            channels: channels.into_iter().map(Arc::new).collect(),
            model_configs: HashMap::new(),
            models_by_set: HashMap::new(),
        }
    }

    fn fixtures() -> (AdaptorRegistry, HealthRegistry, Group) {
        (
            AdaptorRegistry::builtin(),
            HealthRegistry::new(BanPolicy::default()),
            group_with_sets(&["default"]),
        )
    }

    #[test]
    fn resolve_prefers_group_mapping() {
        let mut group = group_with_sets(&["default"]);
        group
            .model_mapping
            .insert("gpt-4o".into(), "gpt-4o-mini".into());

        let (origin, actual) = resolve_model("gpt-4o", &group);
        assert_eq!(origin, "gpt-4o");
        assert_eq!(actual, "gpt-4o-mini");

        let (_, identity) = resolve_model("claude", &group);
        assert_eq!(identity, "claude");
    }

    #[test]
    fn highest_priority_wins() {
        let (registry, health, group) = fixtures();
        let snapshot = snapshot_of(vec![
            channel(1, 0, 1, &["default"]),
            channel(2, 10, 1, &["default"]),
        ]);

        for _ in 0..20 {
            let picked = pick_channel(
                &snapshot, &registry, &health, &group,
                Mode::ChatCompletions, "gpt-4o", &HashSet::new(),
            )
            .unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[test]
    fn banned_partition_falls_through_to_lower_priority() {
        let (registry, health, group) = fixtures();
        let snapshot = snapshot_of(vec![
            channel(1, 0, 1, &["default"]),
            channel(2, 10, 1, &["default"]),
        ]);
        health.force_ban(2, "gpt-4o", Duration::from_secs(60));

        let picked = pick_channel(
            &snapshot, &registry, &health, &group,
            Mode::ChatCompletions, "gpt-4o", &HashSet::new(),
        )
        .unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn all_banned_is_no_channel() {
        let (registry, health, group) = fixtures();
        let snapshot = snapshot_of(vec![channel(1, 0, 1, &["default"])]);
        health.force_ban(1, "gpt-4o", Duration::from_secs(60));

        let err = pick_channel(
            &snapshot, &registry, &health, &group,
            Mode::ChatCompletions, "gpt-4o", &HashSet::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoChannel);
    }

    #[test]
    fn group_set_restricts_candidates() {
        let (registry, health, _) = fixtures();
        let group = group_with_sets(&["premium"]);
        let snapshot = snapshot_of(vec![
            channel(1, 0, 1, &["default"]),
            channel(2, 0, 1, &["premium"]),
        ]);

        let picked = pick_channel(
            &snapshot, &registry, &health, &group,
            Mode::ChatCompletions, "gpt-4o", &HashSet::new(),
        )
        .unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn excluded_and_disabled_channels_are_skipped() {
        let (registry, health, group) = fixtures();
        let mut disabled = channel(3, 0, 1, &["default"]);
        disabled.status = ChannelStatus::Disabled;
        let snapshot = snapshot_of(vec![
            channel(1, 0, 1, &["default"]),
            channel(2, 0, 1, &["default"]),
            disabled,
        ]);

        let exclude: HashSet<i64> = [1].into_iter().collect();
        for _ in 0..10 {
            let picked = pick_channel(
                &snapshot, &registry, &health, &group,
                Mode::ChatCompletions, "gpt-4o", &exclude,
            )
            .unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[test]
    fn unknown_model_is_no_channel() {
        let (registry, health, group) = fixtures();
        let snapshot = snapshot_of(vec![channel(1, 0, 1, &["default"])]);
        let err = pick_channel(
            &snapshot, &registry, &health, &group,
            Mode::ChatCompletions, "claude-nowhere", &HashSet::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoChannel);
    }

    #[test]
    fn weighted_pick_respects_weights() {
        let candidates: Vec<Arc<Channel>> = vec![
            Arc::new(channel(1, 0, 3, &["default"])),
            Arc::new(channel(2, 0, 1, &["default"])),
        ];
        // Rolls 0..2 land on channel 1, roll 3 on channel 2.
        assert_eq!(pick_at(&candidates, 0).id, 1);
        assert_eq!(pick_at(&candidates, 2).id, 1);
        assert_eq!(pick_at(&candidates, 3).id, 2);
    }

    #[test]
    fn zero_weight_channel_is_still_pickable() {
        let candidates: Vec<Arc<Channel>> = vec![Arc::new(channel(1, 0, 0, &["default"]))];
        assert_eq!(pick_at(&candidates, 0).id, 1);
    }
}
