use crate::analytics::{local_end_of_month_utc, parse_reset_timestamp, project_at, RateEstimator};
use crate::auth::load_oauth_credentials;
use crate::models::{
    CostObservation, CostSummary, Organization, Profile, Projection, UsageData, UsageObservation,
    UsageSummary, Workspace,
};
use crate::pacemaker::{BlockageStats, PaceMakerReader, PaceMakerStatus};
use crate::providers::console::{match_user_email, ConsoleApi};
use crate::providers::oauth::UsageApi;
use crate::storage::{Measure, SnapshotStore};
use chrono::{DateTime, Datelike, Local, Utc};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct CodeView {
    pub usage: Option<UsageData>,
    pub profile: Option<Profile>,
    pub utilization_projection: Option<Projection>,
    pub credits_projection: Option<Projection>,
    pub pacemaker: Option<PaceMakerStatus>,
    pub blockages: Option<BlockageStats>,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsoleView {
    pub organization: Option<Organization>,
    pub workspaces: Vec<Workspace>,
    pub usage: Option<UsageSummary>,
    pub cost: Option<CostSummary>,
    pub user_email: Option<String>,
    pub user_cost: Option<f64>,
    pub projection: Option<Projection>,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Which quantity feeds the console snapshot series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostSource {
    User,
    Organization,
}

impl ConsoleView {
    /// The value tracked over time: the signed-in user's Claude Code spend,
    /// or the organization total when the user is unknown.
    pub fn tracked_cost(&self) -> Option<f64> {
        self.user_cost
            .or_else(|| self.cost.as_ref().map(|c| c.total_cost_usd))
    }

    pub fn tracked_source(&self) -> Option<CostSource> {
        if self.user_cost.is_some() {
            Some(CostSource::User)
        } else if self.cost.is_some() {
            Some(CostSource::Organization)
        } else {
            None
        }
    }
}

fn project_to(
    estimator: &RateEstimator<'_>,
    measure: Measure,
    current: Option<f64>,
    boundary: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Projection> {
    let current = current?;
    let boundary = boundary?;
    let rate = estimator.rate_at(measure, Some(current), now);
    project_at(current, rate, boundary, now)
}

pub struct CodeMonitor<A> {
    api: A,
    store: SnapshotStore,
    credentials_path: PathBuf,
    pacemaker: PaceMakerReader,
    view: CodeView,
}

impl<A: UsageApi> CodeMonitor<A> {
    pub fn new(api: A, store: SnapshotStore, credentials_path: PathBuf, pacemaker: PaceMakerReader) -> Self {
        Self {
            api,
            store,
            credentials_path,
            pacemaker,
            view: CodeView::default(),
        }
    }

    pub fn view(&self) -> &CodeView {
        &self.view
    }

    pub async fn poll(&mut self) -> bool {
        self.poll_at(Utc::now()).await
    }

    /// One fetch, store, project cycle. Failures end up in `view.error`;
    /// previously fetched data stays on screen.
    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> bool {
        self.view.pacemaker = self.pacemaker.status();
        self.view.blockages = self.pacemaker.blockage_stats_at(now);

        let creds = match load_oauth_credentials(&self.credentials_path) {
            Ok(creds) => creds,
            Err(err) => {
                tracing::warn!(error = %err, "credential load failed");
                self.view.error = Some(err.to_string());
                return false;
            }
        };

        if self.view.profile.is_none() {
            match self.api.fetch_profile(&creds).await {
                Ok(profile) => self.view.profile = Some(profile),
                Err(err) => tracing::debug!(error = %err, "profile fetch failed"),
            }
        }

        let usage = match self.api.fetch_usage(&creds).await {
            Ok(usage) => usage,
            Err(err) => {
                tracing::warn!(error = %err, "usage fetch failed");
                self.view.error = Some(err.to_string());
                return false;
            }
        };

        let observation = UsageObservation::from_usage(&usage);
        self.store.store_usage_snapshot_at(&observation, now);

        let estimator = RateEstimator::new(&self.store);
        let boundary = observation.resets_at.as_deref().and_then(parse_reset_timestamp);
        self.view.utilization_projection = project_to(
            &estimator,
            Measure::Utilization,
            observation.utilization_percent,
            boundary,
            now,
        );
        self.view.credits_projection = project_to(
            &estimator,
            Measure::Credits,
            observation.credits_used.map(|c| c as f64),
            boundary,
            now,
        );

        tracing::info!(
            utilization = ?observation.utilization_percent,
            credits = ?observation.credits_used,
            "code usage refreshed"
        );
        self.view.usage = Some(usage);
        self.view.last_update = Some(now);
        self.view.error = None;
        true
    }
}

pub struct ConsoleMonitor<C> {
    api: C,
    store: SnapshotStore,
    username: Option<String>,
    cached_email: Option<String>,
    tracked: Option<CostSource>,
    series_start: Option<DateTime<Utc>>,
    view: ConsoleView,
}

impl<C: ConsoleApi> ConsoleMonitor<C> {
    pub fn new(api: C, store: SnapshotStore, username: Option<String>) -> Self {
        Self {
            api,
            store,
            username,
            cached_email: None,
            tracked: None,
            series_start: None,
            view: ConsoleView::default(),
        }
    }

    pub fn view(&self) -> &ConsoleView {
        &self.view
    }

    pub async fn poll(&mut self) -> bool {
        self.poll_at(Utc::now()).await
    }

    async fn current_user_email(&mut self, candidates: &[String]) -> Result<Option<String>, String> {
        if let Some(email) = &self.cached_email {
            return Ok(Some(email.clone()));
        }
        let Some(username) = self.username.clone() else {
            return Ok(None);
        };

        let mut found = match_user_email(&username, candidates.iter().map(String::as_str));
        if found.is_none() {
            let emails = self.api.fetch_user_emails().await.map_err(|err| err.to_string())?;
            found = match_user_email(&username, emails.iter().map(String::as_str));
        }
        if found.is_none() {
            tracing::info!(username = %username, "no organization user matches the system user");
        }
        self.cached_email = found.clone();
        Ok(found)
    }

    /// Snapshots written before the tracked quantity last switched belong to
    /// a different series and must not feed the rate.
    fn series_start(&mut self, source: Option<CostSource>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(source) = source {
            if self.tracked.is_some_and(|prev| prev != source) {
                tracing::info!(to = ?source, "tracked cost switched, restarting rate history");
                self.series_start = Some(now);
            }
            self.tracked = Some(source);
        }
        self.series_start
    }

    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> bool {
        let organization = match self.api.fetch_organization().await {
            Ok(org) => org,
            Err(err) => {
                tracing::warn!(error = %err, "organization fetch failed");
                self.view.error = Some(err.to_string());
                return false;
            }
        };
        self.view.organization = Some(organization);

        let mut error = None;
        let mut note = |err: String| {
            tracing::warn!(error = %err, "console fetch failed");
            error = Some(err);
        };

        let workspaces = match self.api.fetch_workspaces().await {
            Ok(list) => Some(list),
            Err(err) => {
                note(err.to_string());
                None
            }
        };

        let today = now.with_timezone(&Local).date_naive();
        let month_start = today.with_day(1).unwrap_or(today);

        match self.api.fetch_usage_report(month_start, today).await {
            Ok(usage) => self.view.usage = Some(usage),
            Err(err) => note(err.to_string()),
        }
        match self.api.fetch_cost_report(month_start, today).await {
            Ok(cost) => self.view.cost = Some(cost),
            Err(err) => note(err.to_string()),
        }

        match self.api.fetch_claude_code_user_costs(month_start, today).await {
            Ok(users) => {
                let candidates: Vec<String> = users.iter().map(|u| u.email.clone()).collect();
                match self.current_user_email(&candidates).await {
                    Ok(Some(email)) => {
                        self.view.user_cost = Some(
                            users
                                .iter()
                                .find(|u| u.email == email)
                                .map(|u| u.cost_usd)
                                .unwrap_or(0.0),
                        );
                        self.view.user_email = Some(email);
                    }
                    Ok(None) => {}
                    Err(err) => note(err),
                }
            }
            Err(err) => note(err.to_string()),
        }

        if let Some(list) = workspaces {
            self.view.workspaces = list;
        }

        let tracked = self.view.tracked_cost();
        if tracked.is_some() {
            let observation = CostObservation { mtd_cost: tracked };
            let workspaces = (!self.view.workspaces.is_empty()).then_some(self.view.workspaces.as_slice());
            self.store.store_console_snapshot_at(&observation, workspaces, now);
        }

        let series_start = self.series_start(self.view.tracked_source(), now);
        let mut estimator = RateEstimator::new(&self.store);
        if let Some(start) = series_start {
            estimator = estimator.since(start);
        }
        self.view.projection = project_to(
            &estimator,
            Measure::MtdCost,
            tracked,
            local_end_of_month_utc(now),
            now,
        );

        tracing::info!(cost = ?tracked, user = ?self.view.user_email, "console usage refreshed");
        self.view.error = error;
        self.view.last_update = Some(now);
        true
    }
}
