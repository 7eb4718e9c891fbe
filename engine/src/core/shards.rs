//! Shard codec: aggregate document <-> named shards.
//!
//! Every named shard owns exactly one dotted path in the aggregate. Fields no
//! shard owns travel in the residual [`ShardKey::Extras`] shard, so
//! `recompose(decompose(x)) == x` for any well-formed aggregate (one where
//! every owned path is present, which `recompose` always produces).
//!
//! | Shard               | Owned path          |
//! |---------------------|---------------------|
//! | `identity`          | `identity`          |
//! | `realm`             | `realm`             |
//! | `attributes`        | `attributes`        |
//! | `position`          | `position`          |
//! | `equipment`         | `equipment`         |
//! | `inventory`         | `inventory`         |
//! | `currency`          | `currency`          |
//! | `skills`            | `skills`            |
//! | `cultivation`       | `cultivation`       |
//! | `relationships`     | `relationships`     |
//! | `sect`              | `sect`              |
//! | `quests`            | `quests`            |
//! | `world_info`        | `world.info`        |
//! | `world_events`      | `world.events`      |
//! | `memory_short_term` | `memory.short_term` |
//! | `memory_mid_term`   | `memory.mid_term`   |
//! | `memory_long_term`  | `memory.long_term`  |
//! | `memory_implicit`   | `memory.implicit`   |
//! | `time`              | `time`              |
//! | `status_effects`    | `status_effects`    |
//! | `system`            | `system`            |
//! | `extras`            | everything else     |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::path::{CommandPath, kind_label};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardKey {
    Identity,
    Realm,
    Attributes,
    Position,
    Equipment,
    Inventory,
    Currency,
    Skills,
    Cultivation,
    Relationships,
    Sect,
    Quests,
    WorldInfo,
    WorldEvents,
    MemoryShortTerm,
    MemoryMidTerm,
    MemoryLongTerm,
    MemoryImplicit,
    Time,
    StatusEffects,
    System,
    Extras,
}

/// Shards keyed by name; iteration order is stable.
pub type ShardMap = BTreeMap<ShardKey, Value>;

impl ShardKey {
    pub const ALL: [ShardKey; 22] = [
        ShardKey::Identity,
        ShardKey::Realm,
        ShardKey::Attributes,
        ShardKey::Position,
        ShardKey::Equipment,
        ShardKey::Inventory,
        ShardKey::Currency,
        ShardKey::Skills,
        ShardKey::Cultivation,
        ShardKey::Relationships,
        ShardKey::Sect,
        ShardKey::Quests,
        ShardKey::WorldInfo,
        ShardKey::WorldEvents,
        ShardKey::MemoryShortTerm,
        ShardKey::MemoryMidTerm,
        ShardKey::MemoryLongTerm,
        ShardKey::MemoryImplicit,
        ShardKey::Time,
        ShardKey::StatusEffects,
        ShardKey::System,
        ShardKey::Extras,
    ];

    /// Stable storage name, part of the persisted key.
    pub fn name(self) -> &'static str {
        match self {
            ShardKey::Identity => "identity",
            ShardKey::Realm => "realm",
            ShardKey::Attributes => "attributes",
            ShardKey::Position => "position",
            ShardKey::Equipment => "equipment",
            ShardKey::Inventory => "inventory",
            ShardKey::Currency => "currency",
            ShardKey::Skills => "skills",
            ShardKey::Cultivation => "cultivation",
            ShardKey::Relationships => "relationships",
            ShardKey::Sect => "sect",
            ShardKey::Quests => "quests",
            ShardKey::WorldInfo => "world_info",
            ShardKey::WorldEvents => "world_events",
            ShardKey::MemoryShortTerm => "memory_short_term",
            ShardKey::MemoryMidTerm => "memory_mid_term",
            ShardKey::MemoryLongTerm => "memory_long_term",
            ShardKey::MemoryImplicit => "memory_implicit",
            ShardKey::Time => "time",
            ShardKey::StatusEffects => "status_effects",
            ShardKey::System => "system",
            ShardKey::Extras => "extras",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }

    /// Aggregate path owned by this shard; empty for `Extras`.
    pub fn owned_path(self) -> &'static [&'static str] {
        match self {
            ShardKey::Identity => &["identity"],
            ShardKey::Realm => &["realm"],
            ShardKey::Attributes => &["attributes"],
            ShardKey::Position => &["position"],
            ShardKey::Equipment => &["equipment"],
            ShardKey::Inventory => &["inventory"],
            ShardKey::Currency => &["currency"],
            ShardKey::Skills => &["skills"],
            ShardKey::Cultivation => &["cultivation"],
            ShardKey::Relationships => &["relationships"],
            ShardKey::Sect => &["sect"],
            ShardKey::Quests => &["quests"],
            ShardKey::WorldInfo => &["world", "info"],
            ShardKey::WorldEvents => &["world", "events"],
            ShardKey::MemoryShortTerm => &["memory", "short_term"],
            ShardKey::MemoryMidTerm => &["memory", "mid_term"],
            ShardKey::MemoryLongTerm => &["memory", "long_term"],
            ShardKey::MemoryImplicit => &["memory", "implicit"],
            ShardKey::Time => &["time"],
            ShardKey::StatusEffects => &["status_effects"],
            ShardKey::System => &["system"],
            ShardKey::Extras => &[],
        }
    }

    /// Value used when the shard is missing (first load, lost key).
    pub fn default_value(self) -> Value {
        match self {
            ShardKey::Identity => json!({
                "name": "",
                "gender": "",
                "age": 16,
                "origin": "",
                "appearance": "",
                "talents": []
            }),
            ShardKey::Realm => json!({"name": "Mortal", "level": 0, "progress": 0, "bottleneck": false}),
            ShardKey::Attributes => json!({
                "current_hp": 100,
                "max_hp": 100,
                "current_mp": 50,
                "max_mp": 50,
                "current_stamina": 100,
                "max_stamina": 100,
                "strength": 10,
                "agility": 10,
                "constitution": 10,
                "intellect": 10,
                "luck": 10,
                "lifespan": 80
            }),
            ShardKey::Position => json!({"region": "", "location": "", "description": ""}),
            ShardKey::Equipment => json!({
                "weapon": null,
                "armor": null,
                "accessory": null,
                "artifact": null
            }),
            ShardKey::Inventory => json!({"items": {}, "capacity": 50}),
            ShardKey::Currency => json!({"spirit_stones": 0, "gold": 0}),
            ShardKey::Skills | ShardKey::Relationships | ShardKey::Extras => json!({}),
            ShardKey::Cultivation => json!({"technique": null, "progress": 0, "insights": []}),
            ShardKey::Sect => json!({"name": null, "rank": null, "contribution": 0}),
            ShardKey::Quests => json!({"active": [], "completed": []}),
            ShardKey::WorldInfo => json!({"name": "", "era": "", "factions": {}, "lore": []}),
            ShardKey::WorldEvents
            | ShardKey::MemoryShortTerm
            | ShardKey::MemoryMidTerm
            | ShardKey::MemoryLongTerm
            | ShardKey::MemoryImplicit
            | ShardKey::StatusEffects => json!([]),
            ShardKey::Time => json!({"year": 1, "month": 1, "day": 1, "hour": 8}),
            ShardKey::System => json!({"schema_version": 1, "turn": 0, "flags": {}}),
        }
    }

    fn owned() -> impl Iterator<Item = ShardKey> {
        Self::ALL.into_iter().filter(|key| *key != ShardKey::Extras)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("shard '{shard}' is corrupt: expected {expected}, found {found}")]
    Corrupt {
        shard: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// Split `aggregate` into every shard. Missing owned paths get their defaults.
pub fn decompose(aggregate: &Value) -> ShardMap {
    debug_assert!(owned_paths_disjoint(), "shard paths overlap");

    let mut residual = match aggregate {
        Value::Object(_) => aggregate.clone(),
        _ => Value::Object(Map::new()),
    };
    let mut shards = ShardMap::new();
    for key in ShardKey::owned() {
        let value = take(&mut residual, key.owned_path()).unwrap_or_else(|| key.default_value());
        shards.insert(key, value);
    }
    prune_emptied_parents(&mut residual);
    shards.insert(ShardKey::Extras, residual);
    shards
}

/// Rebuild the aggregate from (possibly partial) shards.
///
/// Missing shards are filled with defaults. A present shard whose JSON kind
/// differs from its default's kind is rejected as corrupt.
pub fn recompose(shards: ShardMap) -> Result<Value, CodecError> {
    for (key, value) in &shards {
        let expected = key.default_value();
        if !same_kind(&expected, value) {
            return Err(CodecError::Corrupt {
                shard: key.name(),
                expected: kind_label(&expected),
                found: kind_label(value),
            });
        }
    }
    Ok(assemble(shards))
}

/// Aggregate a brand-new session starts from.
pub fn default_aggregate() -> Value {
    assemble(ShardMap::new())
}

/// Shards whose contents may change when `path` is mutated.
///
/// A path under an owned path touches only that shard. Any other path lies in
/// the residual space or above owned paths, so it touches `Extras` plus every
/// shard owned beneath it.
pub fn shards_for_path(path: &CommandPath) -> BTreeSet<ShardKey> {
    let mut touched = BTreeSet::new();
    for key in ShardKey::owned() {
        let owned = key.owned_path();
        if path.starts_with_segments(owned) {
            return BTreeSet::from([key]);
        }
        if is_prefix_of(path.segments(), owned) {
            touched.insert(key);
        }
    }
    touched.insert(ShardKey::Extras);
    touched
}

pub fn shards_for_paths<'a>(paths: impl IntoIterator<Item = &'a CommandPath>) -> BTreeSet<ShardKey> {
    paths.into_iter().flat_map(shards_for_path).collect()
}

/// True when no owned path is a prefix of another.
pub fn owned_paths_disjoint() -> bool {
    let owned: Vec<&[&str]> = ShardKey::owned().map(ShardKey::owned_path).collect();
    owned.iter().enumerate().all(|(i, left)| {
        owned
            .iter()
            .skip(i + 1)
            .all(|right| !left.starts_with(right) && !right.starts_with(left))
    })
}

fn assemble(mut shards: ShardMap) -> Value {
    let mut aggregate = match shards.remove(&ShardKey::Extras) {
        Some(Value::Object(map)) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };
    for key in ShardKey::owned() {
        let value = shards.remove(&key).unwrap_or_else(|| key.default_value());
        place(&mut aggregate, key.owned_path(), value);
    }
    aggregate
}

/// Remove and return the value at `segments`, if every container exists.
fn take(root: &mut Value, segments: &[&str]) -> Option<Value> {
    let (leaf, parents) = segments.split_last()?;
    let mut current = root;
    for segment in parents {
        current = current.as_object_mut()?.get_mut(*segment)?;
    }
    current.as_object_mut()?.remove(*leaf)
}

/// Insert `value` at `segments`, replacing non-object intermediates.
fn place(root: &mut Value, segments: &[&str], value: Value) {
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(leaf.to_string(), value);
    }
}

/// Drop parent containers that only existed to hold owned paths.
fn prune_emptied_parents(residual: &mut Value) {
    let mut parents: Vec<&[&str]> = ShardKey::owned()
        .map(ShardKey::owned_path)
        .filter(|path| path.len() > 1)
        .flat_map(|path| (1..path.len()).map(move |len| &path[..len]))
        .collect();
    parents.sort_by_key(|parent| std::cmp::Reverse(parent.len()));
    parents.dedup();

    for parent in parents {
        let emptied = lookup_segments(residual, parent)
            .and_then(Value::as_object)
            .is_some_and(Map::is_empty);
        if emptied {
            take(residual, parent);
        }
    }
}

fn lookup_segments<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| current.as_object()?.get(*segment))
}

fn is_prefix_of(prefix: &[String], path: &[&str]) -> bool {
    prefix.len() <= path.len()
        && prefix
            .iter()
            .zip(path)
            .all(|(left, right)| left.as_str() == *right)
}

fn same_kind(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Object(_) => actual.is_object(),
        Value::Array(_) => actual.is_array(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> CommandPath {
        CommandPath::parse(raw).expect("path")
    }

    fn populated() -> Value {
        let mut aggregate = default_aggregate();
        aggregate["identity"]["name"] = json!("Lin Feng");
        aggregate["attributes"]["current_hp"] = json!(73);
        aggregate["inventory"]["items"]["pill"] = json!({"name": "Qi Pill", "quantity": 2});
        aggregate["world"]["events"] = json!([{"title": "Sect war", "description": "..."}]);
        aggregate["world"]["weather"] = json!("storm");
        aggregate["memory"]["short_term"] = json!(["met Elder Mo"]);
        aggregate["npc_cache"] = json!({"elder_mo": {"mood": "wary"}});
        aggregate
    }

    #[test]
    fn owned_paths_are_pairwise_disjoint() {
        assert!(owned_paths_disjoint());
    }

    #[test]
    fn shard_names_are_unique_and_round_trip() {
        let names: BTreeSet<&str> = ShardKey::ALL.iter().map(|key| key.name()).collect();
        assert_eq!(names.len(), ShardKey::ALL.len());
        for key in ShardKey::ALL {
            assert_eq!(ShardKey::from_name(key.name()), Some(key));
        }
    }

    /// Extras living beside owned paths inside `memory` and `world`.
    fn nested_extras() -> Value {
        let mut aggregate = populated();
        aggregate["memory"]["scratch"] = json!({"notes": ["the elder lied"], "pinned": {}});
        aggregate["world"]["weather"] = json!({"kind": "storm", "days_left": 3});
        aggregate["world"]["info"]["factions"]["azure_sect"] = json!({"standing": -2});
        aggregate
    }

    fn null_slots() -> Value {
        let mut aggregate = populated();
        aggregate["equipment"]["weapon"] = Value::Null;
        aggregate["equipment"]["armor"] = json!({"name": "Cloud Robe", "defense": 4});
        aggregate["sect"]["name"] = Value::Null;
        aggregate["cultivation"]["technique"] = Value::Null;
        aggregate
    }

    fn empty_containers() -> Value {
        let mut aggregate = default_aggregate();
        aggregate["quests"] = json!({"active": [], "completed": []});
        aggregate["memory"]["scratch"] = json!({});
        aggregate["world"]["weather"] = json!([]);
        aggregate["npc_cache"] = json!({});
        aggregate["skills"] = json!({});
        aggregate
    }

    #[test]
    fn recompose_of_decompose_is_identity() {
        let fixtures = [
            default_aggregate(),
            populated(),
            nested_extras(),
            null_slots(),
            empty_containers(),
        ];
        for aggregate in fixtures {
            let shards = decompose(&aggregate);
            assert_eq!(shards.len(), ShardKey::ALL.len());
            let rebuilt = recompose(shards).expect("recompose");
            assert_eq!(rebuilt, aggregate);
        }
    }

    #[test]
    fn nested_extras_and_empty_containers_stay_in_extras() {
        let shards = decompose(&nested_extras());
        assert_eq!(
            shards[&ShardKey::Extras]["memory"],
            json!({"scratch": {"notes": ["the elder lied"], "pinned": {}}})
        );
        assert_eq!(shards[&ShardKey::WorldInfo]["factions"]["azure_sect"]["standing"], json!(-2));

        let shards = decompose(&empty_containers());
        assert_eq!(
            shards[&ShardKey::Extras],
            json!({
                "memory": {"scratch": {}},
                "world": {"weather": []},
                "npc_cache": {}
            })
        );
        assert_eq!(shards[&ShardKey::Quests], json!({"active": [], "completed": []}));

        let shards = decompose(&null_slots());
        assert_eq!(shards[&ShardKey::Equipment]["weapon"], Value::Null);
    }

    #[test]
    fn decompose_is_deterministic() {
        let aggregate = populated();
        assert_eq!(decompose(&aggregate), decompose(&aggregate));
    }

    #[test]
    fn residual_fields_land_in_extras() {
        let shards = decompose(&populated());
        assert_eq!(
            shards[&ShardKey::Extras],
            json!({
                "npc_cache": {"elder_mo": {"mood": "wary"}},
                "world": {"weather": "storm"}
            })
        );
        assert_eq!(shards[&ShardKey::Attributes]["current_hp"], json!(73));
    }

    #[test]
    fn recompose_fills_missing_shards_with_defaults() {
        let mut partial = ShardMap::new();
        partial.insert(ShardKey::Realm, json!({"name": "Qi Condensation", "level": 3}));
        let aggregate = recompose(partial).expect("recompose");
        assert_eq!(aggregate["realm"]["name"], json!("Qi Condensation"));
        assert_eq!(aggregate["attributes"], ShardKey::Attributes.default_value());
        assert_eq!(aggregate["memory"]["long_term"], json!([]));
    }

    #[test]
    fn recompose_rejects_wrong_kind() {
        let mut partial = ShardMap::new();
        partial.insert(ShardKey::StatusEffects, json!({"oops": true}));
        let err = recompose(partial).expect_err("corrupt");
        assert_eq!(
            err,
            CodecError::Corrupt {
                shard: "status_effects",
                expected: "array",
                found: "object"
            }
        );
    }

    #[test]
    fn shards_for_path_maps_owned_and_residual_paths() {
        assert_eq!(shards_for_path(&path("realm")), BTreeSet::from([ShardKey::Realm]));
        assert_eq!(
            shards_for_path(&path("attributes.current_hp")),
            BTreeSet::from([ShardKey::Attributes])
        );
        assert_eq!(
            shards_for_path(&path("world.events.0.title")),
            BTreeSet::from([ShardKey::WorldEvents])
        );
        assert_eq!(
            shards_for_path(&path("world")),
            BTreeSet::from([ShardKey::WorldInfo, ShardKey::WorldEvents, ShardKey::Extras])
        );
        assert_eq!(
            shards_for_path(&path("npc_cache.elder_mo")),
            BTreeSet::from([ShardKey::Extras])
        );
    }
}
