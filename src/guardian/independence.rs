//! Independence transition for minor accounts.
//!
//! A profile moves monitoring → warning → preparation as its target date
//! approaches, enters transition once the date is reached with a passing
//! maturity score and every requirement met, and completes after the grace
//! period. Completion flips the account's independence flag, which lifts
//! the kid-safety gate.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::broker::EventEnvelope;
use crate::config::IndependenceConfig;
use crate::error::NotifyError;
use crate::metrics::GuardianMetrics;
use crate::notification::{
    AccountDirectory, IndependencePhase, NotificationDraft, NotificationKind, NotificationType,
};
use crate::pipeline::NotificationPipeline;

use super::independence_store::IndependenceStore;

const INDEPENDENCE_NAMESPACE: Uuid = Uuid::from_u128(0x9d34_0f7a_12c6_4b8e_b5a0_63e1_c8f2_4d17);
const PRODUCER_ID: &str = "independence-service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndependenceProfile {
    pub kid_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardian_id: Option<String>,
    pub target_date: DateTime<Utc>,
    pub maturity_score: f64,
    #[serde(default)]
    pub requirements: BTreeMap<String, bool>,
    pub phase: IndependencePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_started_at: Option<DateTime<Utc>>,
    /// Set by an override; the evaluator leaves pinned profiles alone
    #[serde(default)]
    pub pinned: bool,
    /// The phase changed but its notices have not gone out yet
    #[serde(default)]
    pub notice_pending: bool,
    /// Bumped on every phase change
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl IndependenceProfile {
    pub fn requirements_met(&self) -> bool {
        self.requirements.values().all(|met| *met)
    }
}

/// Fields a caller may set on a profile.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndependenceUpdate {
    pub target_date: DateTime<Utc>,
    #[serde(default)]
    pub maturity_score: f64,
    #[serde(default)]
    pub requirements: BTreeMap<String, bool>,
    #[serde(default)]
    pub guardian_id: Option<String>,
}

/// Phase thresholds.
#[derive(Debug, Clone)]
pub struct IndependenceRules {
    pub warning_window: Duration,
    pub preparation_window: Duration,
    pub grace: Duration,
    pub maturity_threshold: f64,
}

impl Default for IndependenceRules {
    fn default() -> Self {
        Self {
            warning_window: Duration::days(30),
            preparation_window: Duration::days(7),
            grace: Duration::hours(48),
            maturity_threshold: 0.7,
        }
    }
}

impl From<&IndependenceConfig> for IndependenceRules {
    fn from(config: &IndependenceConfig) -> Self {
        Self {
            warning_window: Duration::days(config.warning_days),
            preparation_window: Duration::days(config.preparation_days),
            grace: Duration::hours(config.grace_hours),
            maturity_threshold: config.maturity_threshold,
        }
    }
}

impl IndependenceRules {
    /// Phase a profile should be in at `now`. Complete is terminal.
    pub fn compute(&self, profile: &IndependenceProfile, now: DateTime<Utc>) -> IndependencePhase {
        if profile.phase == IndependencePhase::Complete {
            return IndependencePhase::Complete;
        }

        let ready = now >= profile.target_date
            && profile.maturity_score >= self.maturity_threshold
            && profile.requirements_met();

        if ready {
            let graduated = profile.phase == IndependencePhase::Transition
                && profile
                    .transition_started_at
                    .is_some_and(|started| started + self.grace <= now);
            return if graduated {
                IndependencePhase::Complete
            } else {
                IndependencePhase::Transition
            };
        }

        let remaining = profile.target_date - now;
        if remaining <= self.preparation_window {
            IndependencePhase::Preparation
        } else if remaining <= self.warning_window {
            IndependencePhase::Warning
        } else {
            IndependencePhase::Monitoring
        }
    }
}

/// What one evaluator pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub advanced: usize,
    pub notices_resent: usize,
    pub failed: usize,
}

pub struct IndependenceService {
    store: Arc<dyn IndependenceStore>,
    rules: IndependenceRules,
    directory: Arc<dyn AccountDirectory>,
    pipeline: Arc<NotificationPipeline>,
    /// Serializes phase changes so a flag flip and its notices happen once
    transitions: Mutex<()>,
}

impl IndependenceService {
    pub fn new(
        rules: IndependenceRules,
        store: Arc<dyn IndependenceStore>,
        directory: Arc<dyn AccountDirectory>,
        pipeline: Arc<NotificationPipeline>,
    ) -> Self {
        Self {
            store,
            rules,
            directory,
            pipeline,
            transitions: Mutex::new(()),
        }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub async fn get(&self, kid_id: &str) -> Result<Option<IndependenceProfile>, NotifyError> {
        Ok(self.store.get(kid_id).await?)
    }

    pub async fn count(&self) -> Result<usize, NotifyError> {
        Ok(self.store.count().await?)
    }

    /// Create or update a profile, then evaluate it.
    pub async fn upsert(
        &self,
        kid_id: &str,
        update: IndependenceUpdate,
        now: DateTime<Utc>,
    ) -> Result<IndependenceProfile, NotifyError> {
        let _guard = self.transitions.lock().await;

        let profile = match self.get(kid_id).await? {
            Some(mut existing) => {
                existing.target_date = update.target_date;
                existing.maturity_score = update.maturity_score;
                existing.requirements = update.requirements;
                if update.guardian_id.is_some() {
                    existing.guardian_id = update.guardian_id;
                }
                existing.updated_at = now;
                existing
            }
            None => IndependenceProfile {
                kid_id: kid_id.to_string(),
                guardian_id: update.guardian_id,
                target_date: update.target_date,
                maturity_score: update.maturity_score,
                requirements: update.requirements,
                phase: IndependencePhase::Monitoring,
                transition_started_at: None,
                pinned: false,
                notice_pending: false,
                revision: 0,
                updated_at: now,
            },
        };
        self.store.save(&profile).await?;

        if profile.pinned {
            return Ok(profile);
        }
        let next = self.rules.compute(&profile, now);
        self.transition(profile, next, now).await
    }

    /// Run the evaluator over every unpinned profile, re-sending any
    /// phase-change notices an earlier pass could not deliver.
    #[instrument(name = "independence.evaluate", skip(self))]
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Result<EvaluationSummary, NotifyError> {
        let _guard = self.transitions.lock().await;

        let mut summary = EvaluationSummary::default();
        for mut profile in self.store.due().await? {
            let kid_id = profile.kid_id.clone();

            if profile.notice_pending {
                match self.send_notices(profile).await {
                    Ok(sent) => {
                        summary.notices_resent += 1;
                        profile = sent;
                    }
                    Err(e) => {
                        tracing::warn!(kid_id = %kid_id, error = %e, "Independence notice retry failed");
                        summary.failed += 1;
                        continue;
                    }
                }
            }

            if profile.pinned {
                continue;
            }
            let next = self.rules.compute(&profile, now);
            if next == profile.phase {
                continue;
            }
            match self.transition(profile, next, now).await {
                Ok(_) => summary.advanced += 1,
                Err(e) => {
                    tracing::warn!(kid_id = %kid_id, error = %e, "Independence transition failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Force a phase and pin the profile. Leaving `complete` this way
    /// restores the kid-safety gate.
    pub async fn override_phase(
        &self,
        kid_id: &str,
        phase: IndependencePhase,
        now: DateTime<Utc>,
    ) -> Result<Option<IndependenceProfile>, NotifyError> {
        let _guard = self.transitions.lock().await;

        let Some(mut profile) = self.get(kid_id).await? else {
            return Ok(None);
        };
        let previous = profile.phase;
        profile.pinned = true;

        if previous == IndependencePhase::Complete && phase != IndependencePhase::Complete {
            if self.directory.set_independent(kid_id, false).await? {
                tracing::warn!(kid_id, "Independence revoked by override");
            }
        }
        tracing::info!(kid_id, from = previous.as_str(), to = phase.as_str(), "Independence phase overridden");

        self.transition(profile, phase, now).await.map(Some)
    }

    async fn transition(
        &self,
        mut profile: IndependenceProfile,
        next: IndependencePhase,
        now: DateTime<Utc>,
    ) -> Result<IndependenceProfile, NotifyError> {
        let previous = profile.phase;
        if next == previous {
            self.store.save(&profile).await?;
            return Ok(profile);
        }

        if next == IndependencePhase::Transition {
            profile.transition_started_at = Some(now);
        }
        if next == IndependencePhase::Complete
            && self.directory.set_independent(&profile.kid_id, true).await?
        {
            tracing::info!(kid_id = %profile.kid_id, "Account is now independent");
        }

        profile.phase = next;
        profile.revision += 1;
        profile.updated_at = now;
        profile.notice_pending = true;
        self.store.save(&profile).await?;

        GuardianMetrics::record_phase_change(next.as_str());
        tracing::info!(
            kid_id = %profile.kid_id,
            from = previous.as_str(),
            to = next.as_str(),
            revision = profile.revision,
            "Independence phase changed"
        );

        self.send_notices(profile).await
    }

    /// Deliver the notices for the profile's current phase and clear the
    /// pending flag. The envelope id is fixed per revision, so a retry
    /// after a partial delivery stores nothing twice.
    async fn send_notices(
        &self,
        mut profile: IndependenceProfile,
    ) -> Result<IndependenceProfile, NotifyError> {
        self.notify(&profile).await?;
        profile.notice_pending = false;
        self.store.save(&profile).await?;
        Ok(profile)
    }

    async fn notify(&self, profile: &IndependenceProfile) -> Result<(), NotifyError> {
        let guardian_id = match &profile.guardian_id {
            Some(id) => Some(id.clone()),
            None => self.directory.profile(&profile.kid_id).await?.guardian_id,
        };

        let name = format!(
            "independence:{}:{}:{}",
            profile.kid_id,
            profile.phase.as_str(),
            profile.revision
        );
        let mut envelope = EventEnvelope::new(
            "independence.phase_changed",
            PRODUCER_ID,
            profile.kid_id.as_str(),
            json!({
                "phase": profile.phase.as_str(),
                "maturityScore": profile.maturity_score,
                "targetDate": profile.target_date,
            }),
        );
        envelope.id = Uuid::new_v5(&INDEPENDENCE_NAMESPACE, name.as_bytes());

        let kind = NotificationKind::IndependenceTransition {
            phase: profile.phase,
            maturity_score: profile.maturity_score,
            requirements: profile.requirements.clone(),
        };
        let (kid_title, kid_message) = kid_text(profile.phase);

        let mut drafts = vec![NotificationDraft::new(
            profile.kid_id.as_str(),
            NotificationType::IndependenceDayReminder,
            kid_title,
            kid_message,
        )
        .with_kind(kind.clone())];

        if let Some(guardian_id) = guardian_id {
            drafts.push(
                NotificationDraft::new(
                    guardian_id,
                    NotificationType::IndependenceTransition,
                    "Independence update",
                    format!(
                        "{} is now in the {} phase",
                        profile.kid_id,
                        profile.phase.as_str()
                    ),
                )
                .with_kind(kind),
            );
        }

        self.pipeline.deliver(&envelope, drafts).await?;
        Ok(())
    }
}

fn kid_text(phase: IndependencePhase) -> (&'static str, &'static str) {
    match phase {
        IndependencePhase::Monitoring => ("Independence day", "Your independence day is on the calendar"),
        IndependencePhase::Warning => ("Independence day is coming", "Less than a month to go"),
        IndependencePhase::Preparation => ("Get ready", "Your independence day is less than a week away"),
        IndependencePhase::Transition => ("Transition started", "Your account is moving to full independence"),
        IndependencePhase::Complete => ("Welcome to independence", "Your account is now fully independent"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::guardian::MemoryIndependenceStore;
    use crate::inbox::MemoryInboxBackend;
    use crate::notification::{AccountProfile, DirectoryError, MemoryAccountDirectory};
    use crate::pipeline::tests::pipeline_with;

    fn profile(target_in: Duration, score: f64) -> IndependenceProfile {
        let now = Utc::now();
        IndependenceProfile {
            kid_id: "kid-1".into(),
            guardian_id: Some("parent-1".into()),
            target_date: now + target_in,
            maturity_score: score,
            requirements: BTreeMap::from([("safety_course".to_string(), true)]),
            phase: IndependencePhase::Monitoring,
            transition_started_at: None,
            pinned: false,
            notice_pending: false,
            revision: 0,
            updated_at: now,
        }
    }

    #[test]
    fn test_compute_phases_by_distance() {
        let rules = IndependenceRules::default();
        let now = Utc::now();
        assert_eq!(rules.compute(&profile(Duration::days(60), 0.9), now), IndependencePhase::Monitoring);
        assert_eq!(rules.compute(&profile(Duration::days(20), 0.9), now), IndependencePhase::Warning);
        assert_eq!(rules.compute(&profile(Duration::days(3), 0.9), now), IndependencePhase::Preparation);
        assert_eq!(rules.compute(&profile(-Duration::hours(1), 0.9), now), IndependencePhase::Transition);
    }

    #[test]
    fn test_transition_needs_score_and_requirements() {
        let rules = IndependenceRules::default();
        let now = Utc::now();

        let low = profile(-Duration::hours(1), 0.3);
        assert_eq!(rules.compute(&low, now), IndependencePhase::Preparation);

        let mut unmet = profile(-Duration::hours(1), 0.9);
        unmet.requirements.insert("guardian_sign_off".into(), false);
        assert_eq!(rules.compute(&unmet, now), IndependencePhase::Preparation);
    }

    #[test]
    fn test_complete_after_grace_and_terminal() {
        let rules = IndependenceRules::default();
        let now = Utc::now();

        let mut p = profile(-Duration::days(5), 0.9);
        p.phase = IndependencePhase::Transition;
        p.transition_started_at = Some(now - Duration::hours(1));
        assert_eq!(rules.compute(&p, now), IndependencePhase::Transition);

        p.transition_started_at = Some(now - Duration::hours(49));
        assert_eq!(rules.compute(&p, now), IndependencePhase::Complete);

        p.phase = IndependencePhase::Complete;
        p.maturity_score = 0.0;
        assert_eq!(rules.compute(&p, now), IndependencePhase::Complete);
    }

    async fn service() -> (IndependenceService, Arc<MemoryAccountDirectory>, Arc<MemoryInboxBackend>) {
        let directory = Arc::new(MemoryAccountDirectory::new());
        directory
            .upsert(AccountProfile::minor("kid-1", "parent-1"))
            .await
            .unwrap();
        let inbox = Arc::new(MemoryInboxBackend::new());
        let pipeline = pipeline_with(directory.clone(), inbox.clone());
        let service = IndependenceService::new(
            IndependenceRules::default(),
            Arc::new(MemoryIndependenceStore::new()),
            directory.clone(),
            pipeline,
        );
        (service, directory, inbox)
    }

    #[tokio::test]
    async fn test_completion_flips_flag_once() {
        let (service, directory, inbox) = service().await;
        let start = Utc::now();

        let update = IndependenceUpdate {
            target_date: start - Duration::hours(1),
            maturity_score: 0.9,
            requirements: BTreeMap::new(),
            guardian_id: None,
        };
        let p = service.upsert("kid-1", update, start).await.unwrap();
        assert_eq!(p.phase, IndependencePhase::Transition);
        assert!(directory.profile("kid-1").await.unwrap().is_gated());

        let later = start + Duration::hours(72);
        assert_eq!(service.evaluate_all(later).await.unwrap().advanced, 1);
        let stored = service.get("kid-1").await.unwrap().unwrap();
        assert_eq!(stored.phase, IndependencePhase::Complete);
        assert!(!stored.notice_pending);
        assert!(!directory.profile("kid-1").await.unwrap().is_gated());

        assert_eq!(
            service.evaluate_all(later + Duration::days(1)).await.unwrap(),
            EvaluationSummary::default()
        );

        // one notice per phase for each of kid and guardian
        assert_eq!(inbox.for_user("kid-1").len(), 2);
        assert_eq!(inbox.for_user("parent-1").len(), 2);
    }

    #[tokio::test]
    async fn test_override_pins_and_can_revoke() {
        let (service, directory, _) = service().await;
        let now = Utc::now();
        let update = IndependenceUpdate {
            target_date: now + Duration::days(90),
            maturity_score: 0.2,
            requirements: BTreeMap::new(),
            guardian_id: None,
        };
        service.upsert("kid-1", update, now).await.unwrap();

        let p = service
            .override_phase("kid-1", IndependencePhase::Complete, now)
            .await
            .unwrap()
            .unwrap();
        assert!(p.pinned);
        assert!(!directory.profile("kid-1").await.unwrap().is_gated());
        assert_eq!(service.evaluate_all(now).await.unwrap().advanced, 0);

        service
            .override_phase("kid-1", IndependencePhase::Preparation, now)
            .await
            .unwrap();
        assert!(directory.profile("kid-1").await.unwrap().is_gated());

        assert!(service
            .override_phase("nobody", IndependencePhase::Warning, now)
            .await
            .unwrap()
            .is_none());
    }

    /// Directory that fails lookups while `down` is set.
    #[derive(Default)]
    struct FlakyDirectory {
        inner: MemoryAccountDirectory,
        down: AtomicBool,
    }

    #[async_trait]
    impl AccountDirectory for FlakyDirectory {
        async fn profile(&self, user_id: &str) -> Result<AccountProfile, DirectoryError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DirectoryError::Unavailable("directory offline".into()));
            }
            self.inner.profile(user_id).await
        }

        async fn upsert(&self, profile: AccountProfile) -> Result<(), DirectoryError> {
            self.inner.upsert(profile).await
        }

        async fn set_independent(&self, user_id: &str, independent: bool) -> Result<bool, DirectoryError> {
            self.inner.set_independent(user_id, independent).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_notice_is_resent_on_next_evaluation() {
        let directory = Arc::new(FlakyDirectory::default());
        directory
            .upsert(AccountProfile::minor("kid-1", "parent-1"))
            .await
            .unwrap();
        let inbox = Arc::new(MemoryInboxBackend::new());
        let store = Arc::new(MemoryIndependenceStore::new());
        let service = IndependenceService::new(
            IndependenceRules::default(),
            store.clone(),
            directory.clone(),
            pipeline_with(directory.clone(), inbox.clone()),
        );

        let now = Utc::now();
        let update = IndependenceUpdate {
            target_date: now + Duration::days(60),
            maturity_score: 0.5,
            requirements: BTreeMap::new(),
            guardian_id: Some("parent-1".into()),
        };
        service.upsert("kid-1", update, now).await.unwrap();

        directory.down.store(true, Ordering::SeqCst);
        let later = now + Duration::days(35);
        let summary = service.evaluate_all(later).await.unwrap();
        assert_eq!(summary.advanced, 0);
        assert_eq!(summary.failed, 1);

        // The phase change is kept and the notice is still owed
        let owed = store.get("kid-1").await.unwrap().unwrap();
        assert_eq!(owed.phase, IndependencePhase::Warning);
        assert!(owed.notice_pending);
        assert!(inbox.for_user("kid-1").is_empty());

        directory.down.store(false, Ordering::SeqCst);
        let summary = service.evaluate_all(later).await.unwrap();
        assert_eq!(summary.notices_resent, 1);
        assert_eq!(summary.advanced, 0);
        assert!(!store.get("kid-1").await.unwrap().unwrap().notice_pending);
        assert_eq!(inbox.for_user("kid-1").len(), 1);
        assert_eq!(inbox.for_user("parent-1").len(), 1);

        assert_eq!(service.evaluate_all(later).await.unwrap(), EvaluationSummary::default());
        assert_eq!(inbox.for_user("kid-1").len(), 1);
    }
}
