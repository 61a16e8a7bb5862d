// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Galera recovery evidence, as reported by member agents and as persisted in
//! the status of a `MariaDB` resource.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The seqno a member reports when it does not know its position.
pub const UNKNOWN_SEQNO: i64 = -1;

/// The contents of a member's `grastate.dat`, as reported by its agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GaleraState {
    pub version: String,
    pub uuid: String,
    pub seqno: i64,
    pub safe_to_bootstrap: bool,
}

impl GaleraState {
    pub fn has_valid_seqno(&self) -> bool {
        self.seqno != UNKNOWN_SEQNO
    }
}

/// The position recovered by a member's agent after running local log
/// recovery.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredBootstrap {
    pub uuid: String,
    pub seqno: i64,
}

impl RecoveredBootstrap {
    pub fn has_valid_seqno(&self) -> bool {
        self.seqno != UNKNOWN_SEQNO
    }
}

/// Recovery evidence persisted in the status of a `MariaDB` resource, so a
/// recovery in progress survives controller restarts.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GaleraRecoveryStatus {
    /// State reported by each member's agent, keyed by member name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, GaleraState>,
    /// Positions obtained through local recovery, keyed by member name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recovered: BTreeMap<String, RecoveredBootstrap>,
    /// When the controller committed to a founder. Unset while evidence is
    /// still being collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrapping_since: Option<DateTime<Utc>>,
    /// The member chosen to found the new cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_member: Option<String>,
    /// Set once every member has been restarted after bootstrapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_restarted: Option<bool>,
}

impl GaleraRecoveryStatus {
    pub fn is_empty(&self) -> bool {
        self == &GaleraRecoveryStatus::default()
    }

    /// Returns the JSON merge patch (RFC 7386) that turns `self` into `next`,
    /// or `None` if they are equal.
    ///
    /// Keys present in `self` but absent from `next` are patched to `null`,
    /// which removes them on the server.
    pub fn merge_patch(&self, next: &GaleraRecoveryStatus) -> Result<Option<Value>, serde_json::Error> {
        let previous = serde_json::to_value(self)?;
        let next = serde_json::to_value(next)?;
        Ok(merge_diff(&previous, &next))
    }
}

fn merge_diff(previous: &Value, next: &Value) -> Option<Value> {
    match (previous, next) {
        (Value::Object(previous), Value::Object(next)) => {
            let mut patch = Map::new();
            for (key, old) in previous {
                match next.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        if let Some(diff) = merge_diff(old, new) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new) in next {
                if !previous.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (previous, next) if previous == next => None,
        (_, next) => Some(next.clone()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn state(seqno: i64, safe: bool) -> GaleraState {
        GaleraState {
            version: "2.1".into(),
            uuid: "6b0d8a2e-1f4c-11ef-9d4a-0242ac120002".into(),
            seqno,
            safe_to_bootstrap: safe,
        }
    }

    #[test]
    fn galera_state_wire_format() {
        let decoded: GaleraState = serde_json::from_value(json!({
            "version": "2.1",
            "uuid": "6b0d8a2e-1f4c-11ef-9d4a-0242ac120002",
            "seqno": -1,
            "safeToBootstrap": false,
        }))
        .unwrap();
        assert_eq!(decoded, state(-1, false));
        assert!(!decoded.has_valid_seqno());
    }

    #[test]
    fn recovery_status_round_trips() {
        let status = GaleraRecoveryStatus {
            state: BTreeMap::from([("mariadb-0".to_string(), state(12, true))]),
            recovered: BTreeMap::from([(
                "mariadb-1".to_string(),
                RecoveredBootstrap {
                    uuid: "6b0d8a2e-1f4c-11ef-9d4a-0242ac120002".into(),
                    seqno: 14,
                },
            )]),
            bootstrapping_since: Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap()),
            bootstrap_member: Some("mariadb-1".into()),
            pods_restarted: Some(true),
        };
        let encoded = serde_json::to_string(&status).unwrap();
        let decoded: GaleraRecoveryStatus = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn empty_status_serializes_to_empty_object() {
        let encoded = serde_json::to_value(GaleraRecoveryStatus::default()).unwrap();
        assert_eq!(encoded, json!({}));
        let decoded: GaleraRecoveryStatus = serde_json::from_value(json!({})).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn merge_patch_adds_and_removes_keys() {
        let previous = GaleraRecoveryStatus {
            state: BTreeMap::from([
                ("mariadb-0".to_string(), state(3, false)),
                ("mariadb-1".to_string(), state(-1, false)),
            ]),
            ..Default::default()
        };
        let mut next = previous.clone();
        next.state.remove("mariadb-1");
        next.state.insert("mariadb-2".into(), state(7, false));

        let patch = previous.merge_patch(&next).unwrap().unwrap();
        assert_eq!(
            patch,
            json!({
                "state": {
                    "mariadb-1": null,
                    "mariadb-2": {
                        "version": "2.1",
                        "uuid": "6b0d8a2e-1f4c-11ef-9d4a-0242ac120002",
                        "seqno": 7,
                        "safeToBootstrap": false,
                    },
                },
            })
        );
    }

    #[test]
    fn merge_patch_clears_everything_on_reset() {
        let previous = GaleraRecoveryStatus {
            state: BTreeMap::from([("mariadb-0".to_string(), state(3, false))]),
            bootstrapping_since: Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap()),
            bootstrap_member: Some("mariadb-0".into()),
            ..Default::default()
        };
        let patch = previous
            .merge_patch(&GaleraRecoveryStatus::default())
            .unwrap()
            .unwrap();
        assert_eq!(
            patch,
            json!({"state": null, "bootstrappingSince": null, "bootstrapMember": null})
        );
    }

    #[test]
    fn merge_patch_of_equal_statuses_is_none() {
        let status = GaleraRecoveryStatus {
            state: BTreeMap::from([("mariadb-0".to_string(), state(3, false))]),
            ..Default::default()
        };
        assert_eq!(status.merge_patch(&status.clone()).unwrap(), None);
    }

    #[test]
    fn merge_patch_only_sends_changed_fields() {
        let previous = GaleraRecoveryStatus {
            state: BTreeMap::from([("mariadb-0".to_string(), state(3, false))]),
            ..Default::default()
        };
        let mut next = previous.clone();
        next.state.get_mut("mariadb-0").unwrap().seqno = 4;
        let patch = previous.merge_patch(&next).unwrap().unwrap();
        assert_eq!(patch, json!({"state": {"mariadb-0": {"seqno": 4}}}));
    }
}
