// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub mod galera;
pub mod mariadb;

/// Condition type reporting whether the Galera cluster has a primary
/// component of sufficient size.
pub const CONDITION_GALERA_READY: &str = "GaleraReady";
/// Condition type reporting overall readiness of the resource.
pub const CONDITION_READY: &str = "Ready";

/// Inserts or replaces the condition of the same type.
///
/// The transition time of an existing condition is kept when its status does
/// not change, so that callers can measure how long a condition has held.
/// Returns whether anything observable changed.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            let changed = existing.status != condition.status
                || existing.reason != condition.reason
                || existing.message != condition.message
                || existing.observed_generation != condition.observed_generation;
            *existing = condition;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Builds a condition stamped with the current time.
pub fn new_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.into(),
        status: if status { "True" } else { "False" }.into(),
        last_transition_time: Time(chrono::offset::Utc::now()),
        message: message.into(),
        observed_generation,
        reason: reason.into(),
    }
}
