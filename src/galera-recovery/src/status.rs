// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use galera_cloud_resources::crd::galera::{
    GaleraRecoveryStatus, GaleraState, RecoveredBootstrap,
};

use crate::error::RecoveryError;
use crate::select::{self, BootstrapSource};

/// Everything a single member has told us about its position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberEvidence {
    /// The state the member's agent reported.
    pub reported: Option<GaleraState>,
    /// The position the member's agent obtained through local recovery.
    pub recovered: Option<RecoveredBootstrap>,
}

/// The evidence of a member that takes part in source selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Evidence<'a> {
    Unknown,
    Reported(&'a GaleraState),
    Recovered(&'a RecoveredBootstrap),
}

impl<'a> Evidence<'a> {
    /// The `(uuid, seqno)` this evidence vouches for, if any.
    pub fn position(self) -> Option<(&'a str, i64)> {
        match self {
            Evidence::Unknown => None,
            Evidence::Reported(state) => Some((&state.uuid, state.seqno)),
            Evidence::Recovered(recovered) => Some((&recovered.uuid, recovered.seqno)),
        }
    }
}

impl MemberEvidence {
    /// Whether this member counts toward completeness. A recovered position
    /// always does; a reported one only with a known seqno.
    pub fn is_valid(&self) -> bool {
        self.recovered.is_some()
            || self
                .reported
                .as_ref()
                .map_or(false, GaleraState::has_valid_seqno)
    }

    /// The evidence this member competes with during source selection.
    ///
    /// A recovered position reflects a later look at the member's logs than
    /// the reported state, so it wins when both carry a known seqno.
    pub fn candidate(&self) -> Evidence<'_> {
        match (&self.recovered, &self.reported) {
            (Some(recovered), _) if recovered.has_valid_seqno() => Evidence::Recovered(recovered),
            (_, Some(reported)) if reported.has_valid_seqno() => Evidence::Reported(reported),
            _ => Evidence::Unknown,
        }
    }

    fn is_empty(&self) -> bool {
        self.reported.is_none() && self.recovered.is_none()
    }
}

/// Recovery evidence and progress for one cluster.
///
/// A `RecoveryStatus` is owned by the single reconciliation that drives a
/// cluster's recovery; mutation requires `&mut self`, so every operation is
/// atomic with respect to every other. Callers that query
/// [`RecoveryStatus::is_complete`] and then [`RecoveryStatus::bootstrap_source`]
/// across an await point must expect the evidence to have grown in between;
/// both queries are pure functions of the current evidence, so re-running them
/// is always safe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStatus {
    members: BTreeMap<String, MemberEvidence>,
    bootstrapping_since: Option<DateTime<Utc>>,
    bootstrap_member: Option<String>,
    pods_restarted: bool,
}

impl RecoveryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&mut self, member: &str, state: GaleraState) {
        self.members.entry(member.to_owned()).or_default().reported = Some(state);
    }

    pub fn state(&self, member: &str) -> Option<&GaleraState> {
        self.members.get(member)?.reported.as_ref()
    }

    pub fn set_recovered(&mut self, member: &str, bootstrap: RecoveredBootstrap) {
        self.members.entry(member.to_owned()).or_default().recovered = Some(bootstrap);
    }

    pub fn recovered(&self, member: &str) -> Option<&RecoveredBootstrap> {
        self.members.get(member)?.recovered.as_ref()
    }

    pub fn evidence(&self, member: &str) -> Option<&MemberEvidence> {
        self.members.get(member)
    }

    /// Discards all evidence and progress.
    pub fn reset(&mut self) {
        *self = RecoveryStatus::default();
    }

    /// Records that `member` was chosen to bootstrap, starting the bootstrap
    /// clock. Has no effect if bootstrapping is already underway.
    pub fn set_bootstrapping(&mut self, member: &str) {
        self.set_bootstrapping_at(member, Utc::now())
    }

    pub fn set_bootstrapping_at(&mut self, member: &str, now: DateTime<Utc>) {
        if self.bootstrapping_since.is_some() {
            return;
        }
        self.bootstrapping_since = Some(now);
        self.bootstrap_member = Some(member.to_owned());
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping_since.is_some()
    }

    pub fn bootstrapping_since(&self) -> Option<DateTime<Utc>> {
        self.bootstrapping_since
    }

    pub fn bootstrap_member(&self) -> Option<&str> {
        self.bootstrap_member.as_deref()
    }

    /// The instant after which bootstrapping is considered stuck.
    pub fn bootstrap_deadline(&self, timeout: Duration) -> Option<DateTime<Utc>> {
        let since = self.bootstrapping_since?;
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        Some(since.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// Whether bootstrapping has been underway for longer than `timeout`.
    pub fn bootstrap_timeout(&self, timeout: Duration) -> bool {
        self.bootstrap_timeout_at(timeout, Utc::now())
    }

    pub fn bootstrap_timeout_at(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.bootstrap_deadline(timeout)
            .map_or(false, |deadline| now > deadline)
    }

    pub fn set_pods_restarted(&mut self, restarted: bool) {
        self.pods_restarted = restarted;
    }

    pub fn pods_restarted(&self) -> bool {
        self.pods_restarted
    }

    /// The first live member that asserted it is safe to bootstrap from.
    pub fn safe_to_bootstrap(&self, members: &[String]) -> Result<BootstrapSource, RecoveryError> {
        select::safe_to_bootstrap(&self.members, members)
    }

    /// Whether enough evidence has been collected to choose a bootstrap
    /// source among `members`.
    pub fn is_complete(&self, members: &[String]) -> bool {
        select::is_complete(&self.members, members)
    }

    /// Chooses the member to bootstrap from among `members`.
    pub fn bootstrap_source(&self, members: &[String]) -> Result<BootstrapSource, RecoveryError> {
        select::bootstrap_source(&self.members, members)
    }

    /// Live members that have not yet contributed valid evidence.
    pub fn missing_evidence<'a>(&self, members: &'a [String]) -> Vec<&'a String> {
        members
            .iter()
            .filter(|member| {
                !self
                    .members
                    .get(member.as_str())
                    .map_or(false, MemberEvidence::is_valid)
            })
            .collect()
    }

    /// Live members with no position to compete with in source selection.
    /// A superset of [`RecoveryStatus::missing_evidence`]: it also includes
    /// members whose local recovery came back with an unknown seqno.
    pub fn unpositioned<'a>(&self, members: &'a [String]) -> Vec<&'a String> {
        members
            .iter()
            .filter(|member| {
                self.members
                    .get(member.as_str())
                    .map_or(true, |evidence| evidence.candidate() == Evidence::Unknown)
            })
            .collect()
    }

    /// The form persisted in the `MariaDB` status.
    pub fn to_persisted(&self) -> GaleraRecoveryStatus {
        GaleraRecoveryStatus {
            state: self
                .members
                .iter()
                .filter_map(|(member, evidence)| {
                    Some((member.clone(), evidence.reported.clone()?))
                })
                .collect(),
            recovered: self
                .members
                .iter()
                .filter_map(|(member, evidence)| {
                    Some((member.clone(), evidence.recovered.clone()?))
                })
                .collect(),
            bootstrapping_since: self.bootstrapping_since,
            bootstrap_member: self.bootstrap_member.clone(),
            pods_restarted: self.pods_restarted.then_some(true),
        }
    }
}

impl From<&GaleraRecoveryStatus> for RecoveryStatus {
    fn from(persisted: &GaleraRecoveryStatus) -> Self {
        let mut members: BTreeMap<String, MemberEvidence> = BTreeMap::new();
        for (member, state) in &persisted.state {
            members.entry(member.clone()).or_default().reported = Some(state.clone());
        }
        for (member, recovered) in &persisted.recovered {
            members.entry(member.clone()).or_default().recovered = Some(recovered.clone());
        }
        members.retain(|_, evidence| !evidence.is_empty());
        RecoveryStatus {
            members,
            bootstrapping_since: persisted.bootstrapping_since,
            bootstrap_member: persisted.bootstrap_member.clone(),
            pods_restarted: persisted.pods_restarted.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn uuid(member: &str) -> String {
        format!("uuid-{member}")
    }

    fn state(member: &str, seqno: i64, safe: bool) -> GaleraState {
        GaleraState {
            version: "2.1".into(),
            uuid: uuid(member),
            seqno,
            safe_to_bootstrap: safe,
        }
    }

    fn recovered(member: &str, seqno: i64) -> RecoveredBootstrap {
        RecoveredBootstrap {
            uuid: uuid(member),
            seqno,
        }
    }

    #[test]
    fn safe_to_bootstrap_wins_over_higher_seqno() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", -1, false));
        status.set_state("m1", state("m1", 1, true));
        status.set_state("m2", state("m2", 2, false));
        let live = members(&["m0", "m1", "m2"]);

        assert!(status.is_complete(&live));
        assert_eq!(
            status.bootstrap_source(&live).unwrap(),
            BootstrapSource {
                uuid: uuid("m1"),
                seqno: 1,
                member: "m1".into(),
            }
        );
    }

    #[test]
    fn safe_to_bootstrap_wins_over_recovered_seqno() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 5, true));
        status.set_recovered("m1", recovered("m1", 50));
        let live = members(&["m0", "m1"]);

        assert_eq!(status.bootstrap_source(&live).unwrap().member, "m0");
    }

    #[test]
    fn highest_recovered_seqno_wins() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 3, false));
        status.set_state("m1", state("m1", 6, false));
        status.set_recovered("m2", recovered("m2", 9));
        let live = members(&["m0", "m1", "m2"]);

        assert!(status.is_complete(&live));
        assert_eq!(
            status.bootstrap_source(&live).unwrap(),
            BootstrapSource {
                uuid: uuid("m2"),
                seqno: 9,
                member: "m2".into(),
            }
        );
    }

    #[test]
    fn unknown_seqno_counts_as_missing() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 1, false));
        status.set_state("m1", state("m1", -1, false));
        status.set_recovered("m2", recovered("m2", 1));
        let live = members(&["m0", "m1", "m2"]);

        assert!(!status.is_complete(&live));
        assert_eq!(status.missing_evidence(&live), vec!["m1"]);
    }

    #[test]
    fn recovery_completes_member_with_unknown_seqno() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 1, false));
        status.set_state("m1", state("m1", -1, false));
        let live = members(&["m0", "m1"]);
        assert!(!status.is_complete(&live));

        status.set_recovered("m1", recovered("m1", 4));
        assert!(status.is_complete(&live));
        assert_eq!(status.bootstrap_source(&live).unwrap().member, "m1");
    }

    #[test]
    fn unsafe_member_with_unknown_seqno_is_not_trusted() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", -1, true));
        let live = members(&["m0"]);

        assert!(status.safe_to_bootstrap(&live).is_err());
        assert!(!status.is_complete(&live));
        assert!(matches!(
            status.bootstrap_source(&live),
            Err(RecoveryError::BootstrapSourceNotFound)
        ));
    }

    #[test]
    fn recovered_is_preferred_over_reported_for_the_same_member() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 7, false));
        status.set_recovered("m0", recovered("m0", 4));
        status.set_state("m1", state("m1", 5, false));
        let live = members(&["m0", "m1"]);

        assert_eq!(
            status.evidence("m0").unwrap().candidate(),
            Evidence::Recovered(&recovered("m0", 4))
        );
        assert_eq!(status.bootstrap_source(&live).unwrap().member, "m1");
    }

    #[test]
    fn reported_is_used_when_recovered_seqno_is_unknown() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 7, false));
        status.set_recovered("m0", recovered("m0", -1));

        assert_eq!(
            status.evidence("m0").unwrap().candidate(),
            Evidence::Reported(&state("m0", 7, false))
        );
    }

    #[test]
    fn ties_go_to_the_first_listed_member() {
        let mut status = RecoveryStatus::new();
        status.set_state("m2", state("m2", 8, false));
        status.set_state("m0", state("m0", 8, false));
        status.set_state("m1", state("m1", 8, false));

        let source = status.bootstrap_source(&members(&["m1", "m0", "m2"])).unwrap();
        assert_eq!(source.member, "m1");
        let source = status.bootstrap_source(&members(&["m2", "m1", "m0"])).unwrap();
        assert_eq!(source.member, "m2");
    }

    #[test]
    fn stale_members_are_ignored() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 3, false));
        status.set_state("m1", state("m1", 4, false));
        // Scaled away after the crash.
        status.set_state("m2", state("m2", 99, true));
        status.set_recovered("m3", recovered("m3", 100));
        let live = members(&["m0", "m1"]);

        assert!(status.safe_to_bootstrap(&live).is_err());
        assert!(status.is_complete(&live));
        assert_eq!(status.bootstrap_source(&live).unwrap().member, "m1");
    }

    #[test]
    fn no_evidence_means_no_source() {
        let status = RecoveryStatus::new();
        let live = members(&["m0", "m1"]);
        assert!(!status.is_complete(&live));
        assert!(matches!(
            status.bootstrap_source(&live),
            Err(RecoveryError::BootstrapSourceNotFound)
        ));
    }

    #[test]
    fn set_bootstrapping_is_idempotent() {
        let mut status = RecoveryStatus::new();
        let first = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 5, 2, 9, 45, 0).unwrap();

        status.set_bootstrapping_at("m1", first);
        status.set_bootstrapping_at("m2", second);
        assert!(status.is_bootstrapping());
        assert_eq!(status.bootstrapping_since(), Some(first));
        assert_eq!(status.bootstrap_member(), Some("m1"));

        let since = status.bootstrapping_since();
        status.set_bootstrapping("m0");
        assert_eq!(status.bootstrapping_since(), since);
    }

    #[test]
    fn bootstrap_timeout_requires_bootstrapping() {
        let mut status = RecoveryStatus::new();
        let timeout = Duration::from_secs(600);
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap();
        assert!(!status.bootstrap_timeout_at(timeout, start));

        status.set_bootstrapping_at("m0", start);
        assert!(!status.bootstrap_timeout_at(timeout, start + TimeDelta::minutes(10)));
        assert!(status.bootstrap_timeout_at(timeout, start + TimeDelta::seconds(601)));
        assert_eq!(
            status.bootstrap_deadline(timeout),
            Some(start + TimeDelta::minutes(10))
        );
    }

    #[test]
    fn reset_clears_everything() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 3, false));
        status.set_recovered("m1", recovered("m1", 4));
        status.set_bootstrapping("m1");
        status.set_pods_restarted(true);

        status.reset();
        assert!(!status.is_bootstrapping());
        assert_eq!(status.bootstrap_member(), None);
        assert!(!status.pods_restarted());
        assert_eq!(status.state("m0"), None);
        assert_eq!(status.recovered("m1"), None);
        assert!(status.to_persisted().is_empty());
    }

    #[test]
    fn persisted_form_round_trips() {
        let mut status = RecoveryStatus::new();
        status.set_state("m0", state("m0", 3, false));
        status.set_state("m1", state("m1", -1, false));
        status.set_recovered("m1", recovered("m1", 4));
        status.set_recovered("m2", recovered("m2", 2));
        status.set_bootstrapping_at("m1", Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap());
        status.set_pods_restarted(true);

        let persisted = status.to_persisted();
        assert_eq!(persisted.state.len(), 2);
        assert_eq!(persisted.recovered.len(), 2);
        assert_eq!(persisted.pods_restarted, Some(true));

        let encoded = serde_json::to_string(&persisted).unwrap();
        let decoded: GaleraRecoveryStatus = serde_json::from_str(&encoded).unwrap();
        assert_eq!(RecoveryStatus::from(&decoded), status);
        assert_eq!(RecoveryStatus::from(&decoded).to_persisted(), persisted);
    }

    fn arb_seqno() -> impl Strategy<Value = i64> {
        prop_oneof![Just(-1i64), 0i64..20]
    }

    fn arb_evidence() -> impl Strategy<Value = MemberEvidence> {
        (
            proptest::option::of((arb_seqno(), any::<bool>())),
            proptest::option::of(arb_seqno()),
        )
            .prop_map(|(reported, recovered)| MemberEvidence {
                reported: reported.map(|(seqno, safe)| GaleraState {
                    version: "2.1".into(),
                    uuid: format!("r{seqno}"),
                    seqno,
                    safe_to_bootstrap: safe,
                }),
                recovered: recovered.map(|seqno| RecoveredBootstrap {
                    uuid: format!("c{seqno}"),
                    seqno,
                }),
            })
    }

    fn arb_status() -> impl Strategy<Value = (RecoveryStatus, Vec<String>)> {
        proptest::collection::vec(arb_evidence(), 1..6).prop_map(|evidence| {
            let live: Vec<String> = (0..evidence.len()).map(|i| format!("m{i}")).collect();
            let mut status = RecoveryStatus::new();
            for (member, evidence) in live.iter().zip(evidence) {
                if let Some(state) = evidence.reported {
                    status.set_state(member, state);
                }
                if let Some(recovered) = evidence.recovered {
                    status.set_recovered(member, recovered);
                }
            }
            (status, live)
        })
    }

    proptest! {
        #[test]
        fn selection_is_deterministic((status, live) in arb_status()) {
            let first = status.bootstrap_source(&live).ok();
            for _ in 0..3 {
                prop_assert_eq!(status.bootstrap_source(&live).ok(), first.clone());
            }
            prop_assert_eq!(status.clone().bootstrap_source(&live).ok(), first);
        }

        #[test]
        fn selected_seqno_is_maximal((status, live) in arb_status()) {
            prop_assume!(status.safe_to_bootstrap(&live).is_err());
            if let Ok(source) = status.bootstrap_source(&live) {
                prop_assert!(source.seqno != -1);
                for member in &live {
                    let candidate = status.evidence(member).and_then(|e| e.candidate().position());
                    if let Some((_, seqno)) = candidate {
                        prop_assert!(source.seqno >= seqno);
                    }
                }
            }
        }

        #[test]
        fn members_without_valid_evidence_are_never_selected((status, live) in arb_status()) {
            if let Ok(source) = status.bootstrap_source(&live) {
                let evidence = status.evidence(&source.member).unwrap();
                prop_assert!(evidence.candidate() != Evidence::Unknown);
            }
            for member in &live {
                let invalid = status.evidence(member).map_or(true, |e| !e.is_valid());
                if invalid && status.safe_to_bootstrap(&live).is_err() {
                    prop_assert!(!status.is_complete(&live));
                }
            }
        }
    }
}
