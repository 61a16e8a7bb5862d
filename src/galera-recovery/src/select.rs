// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Bootstrap source selection.
//!
//! These functions decide, from possibly partial evidence, which member's data
//! becomes authoritative. They walk the ordered member list rather than the
//! evidence map, so ties always resolve to the member that comes first in the
//! list no matter how the evidence was inserted. Evidence for members that are
//! not in the list is stale (the cluster was scaled down) and never consulted.

use std::collections::BTreeMap;

use crate::error::RecoveryError;
use crate::status::MemberEvidence;

/// The member chosen to bootstrap a new cluster, and the position it must
/// bootstrap from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapSource {
    pub uuid: String,
    pub seqno: i64,
    pub member: String,
}

/// Returns the first member that asserted `safe_to_bootstrap` with a known
/// seqno.
pub(crate) fn safe_to_bootstrap(
    evidence: &BTreeMap<String, MemberEvidence>,
    members: &[String],
) -> Result<BootstrapSource, RecoveryError> {
    members
        .iter()
        .find_map(|member| {
            let state = evidence.get(member)?.reported.as_ref()?;
            (state.safe_to_bootstrap && state.has_valid_seqno()).then(|| BootstrapSource {
                uuid: state.uuid.clone(),
                seqno: state.seqno,
                member: member.clone(),
            })
        })
        .ok_or(RecoveryError::SafeToBootstrapNotFound)
}

/// Reports whether there is enough evidence to pick a bootstrap source.
///
/// A safe-to-bootstrap member settles the question immediately. Otherwise
/// every member must have contributed valid evidence.
pub(crate) fn is_complete(evidence: &BTreeMap<String, MemberEvidence>, members: &[String]) -> bool {
    if safe_to_bootstrap(evidence, members).is_ok() {
        return true;
    }
    members.iter().all(|member| {
        evidence
            .get(member)
            .map_or(false, MemberEvidence::is_valid)
    })
}

/// Picks the member to bootstrap from: the safe-to-bootstrap member if there
/// is one, else the member with the highest known seqno. Ties go to the member
/// listed first.
pub(crate) fn bootstrap_source(
    evidence: &BTreeMap<String, MemberEvidence>,
    members: &[String],
) -> Result<BootstrapSource, RecoveryError> {
    if let Ok(source) = safe_to_bootstrap(evidence, members) {
        return Ok(source);
    }

    let mut best: Option<BootstrapSource> = None;
    for member in members {
        let Some((uuid, seqno)) = evidence
            .get(member)
            .and_then(|evidence| evidence.candidate().position())
        else {
            continue;
        };
        if best.as_ref().map_or(true, |best| seqno > best.seqno) {
            best = Some(BootstrapSource {
                uuid: uuid.to_owned(),
                seqno,
                member: member.clone(),
            });
        }
    }
    best.ok_or(RecoveryError::BootstrapSourceNotFound)
}
