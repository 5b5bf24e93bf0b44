//! Plan execution.
//!
//! This module executes plans wave by wave. Items inside a wave run
//! concurrently up to the configured parallelism; the next wave starts only
//! after every item of the current one has finished. Each successful item is
//! committed to state before it is reported, so an interrupted run resumes
//! from what actually exists.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{PlanError, ProviderError, Result, StackError};
use crate::model::{substitute_references, Reference, Resource};
use crate::provider::Provider;
use crate::state::{Identifiers, StateRecord, StateStore};

use super::diff::Action;
use super::plan::{Plan, PlanItem};

/// Retry schedule for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Builds the policy from executor settings.
    #[must_use]
    pub const fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// A provider hint replaces the exponential schedule.
    #[must_use]
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_backoff);
        }
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Shared flag requesting that no new items be started.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a single plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// The resource was created and committed.
    Created,
    /// The resource was updated and committed.
    Updated,
    /// The resource was deleted and its record removed.
    Deleted,
    /// Nothing to do.
    Noop,
    /// The provider call failed.
    Failed,
    /// A dependency did not succeed.
    Skipped,
    /// The run was cancelled before the item started.
    Cancelled,
}

impl ItemStatus {
    /// Returns true if the item left the stack as declared.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted | Self::Noop)
    }
}

/// Report for a single plan item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    /// Resource id.
    pub resource_id: String,
    /// Planned action.
    pub action: Action,
    /// Outcome.
    pub status: ItemStatus,
    /// Provider calls made.
    pub attempts: u32,
    /// Error message for failed and skipped items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifiers committed for created and updated items.
    #[serde(skip_serializing_if = "Identifiers::is_empty")]
    pub identifiers: Identifiers,
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    /// Created items.
    pub created: usize,
    /// Updated items.
    pub updated: usize,
    /// Deleted items.
    pub deleted: usize,
    /// Unchanged items.
    pub noop: usize,
    /// Failed items.
    pub failed: usize,
    /// Skipped items.
    pub skipped: usize,
    /// Cancelled items.
    pub cancelled: usize,
}

/// Report of a whole plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Stack id.
    pub stack: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Whether cancellation was requested.
    pub aborted: bool,
    /// Item reports in plan order.
    pub items: Vec<ItemReport>,
}

impl ExecutionReport {
    /// Counts items by status.
    #[must_use]
    pub fn summary(&self) -> ExecutionSummary {
        self.items
            .iter()
            .fold(ExecutionSummary::default(), |mut acc, item| {
                match item.status {
                    ItemStatus::Created => acc.created += 1,
                    ItemStatus::Updated => acc.updated += 1,
                    ItemStatus::Deleted => acc.deleted += 1,
                    ItemStatus::Noop => acc.noop += 1,
                    ItemStatus::Failed => acc.failed += 1,
                    ItemStatus::Skipped => acc.skipped += 1,
                    ItemStatus::Cancelled => acc.cancelled += 1,
                }
                acc
            })
    }

    /// Returns true if every item succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.aborted && self.items.iter().all(|i| i.status.is_success())
    }

    /// Gets the report for a resource.
    #[must_use]
    pub fn item(&self, resource_id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|i| i.resource_id == resource_id)
    }

    /// Ids of resources the run changed.
    #[must_use]
    pub fn changed(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| {
                matches!(
                    i.status,
                    ItemStatus::Created | ItemStatus::Updated | ItemStatus::Deleted
                )
            })
            .map(|i| i.resource_id.clone())
            .collect()
    }

    /// First failure message, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|i| i.status == ItemStatus::Failed)
            .and_then(|i| i.error.as_deref())
    }
}

impl std::fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped, {} cancelled",
            self.created,
            self.updated,
            self.deleted,
            self.noop,
            self.failed,
            self.skipped,
            self.cancelled
        )
    }
}

impl ItemReport {
    fn new(resource_id: &str, action: Action, status: ItemStatus) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            action,
            status,
            attempts: 0,
            error: None,
            identifiers: Identifiers::new(),
        }
    }

    fn failed(resource_id: &str, action: Action, attempts: u32, message: String) -> Self {
        Self {
            attempts,
            error: Some(message),
            ..Self::new(resource_id, action, ItemStatus::Failed)
        }
    }
}

/// Executor for plans.
pub struct PlanExecutor {
    /// Provider applying the actions.
    provider: Arc<dyn Provider>,
    /// Store receiving per-item commits.
    store: Arc<dyn StateStore>,
    /// Retry schedule.
    policy: RetryPolicy,
    /// Maximum concurrent items within a wave.
    max_parallel: usize,
    /// Cancellation flag.
    abort: AbortSignal,
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>, config: &ExecutorConfig) -> Self {
        Self {
            provider,
            store,
            policy: RetryPolicy::from_config(config),
            max_parallel: config.max_parallel.max(1),
            abort: AbortSignal::new(),
        }
    }

    /// Overrides the parallelism.
    #[must_use]
    pub fn with_parallelism(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Uses `signal` for cancellation.
    #[must_use]
    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Returns the cancellation flag.
    #[must_use]
    pub const fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Executes a plan.
    ///
    /// Item failures are reported, not returned: a failed item marks its
    /// dependents as skipped while independent items proceed.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a commit fails. Items
    /// already in flight are allowed to finish first; a commit failing with
    /// a stack-fatal error also stops their pending retries.
    pub async fn execute(&self, plan: &Plan) -> Result<ExecutionReport> {
        let started_at = Utc::now();
        info!("Executing plan for {}: {}", plan.stack, plan.summary());

        let mut outputs: HashMap<String, Identifiers> = self
            .store
            .load(&plan.stack)
            .await?
            .into_iter()
            .map(|(id, record)| (id, record.provider_identifiers))
            .collect();
        let mut unsettled: HashSet<String> = HashSet::new();
        let mut reports = Vec::with_capacity(plan.len());
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        for wave in &plan.waves {
            debug!("Starting wave {} ({} items)", wave.index, wave.items.len());

            let mut slots: Vec<Option<ItemReport>> = vec![None; wave.items.len()];
            let mut tasks: JoinSet<Result<(usize, ItemReport)>> = JoinSet::new();

            for (slot, item) in wave.items.iter().enumerate() {
                if self.abort.is_aborted() {
                    slots[slot] = Some(ItemReport::new(&item.resource_id, item.action, ItemStatus::Cancelled));
                    continue;
                }

                if let Some(dep) = item.blocked_by.iter().find(|d| unsettled.contains(*d)) {
                    warn!("Skipping {}: dependency '{dep}' did not succeed", item.resource_id);
                    slots[slot] = Some(ItemReport {
                        error: Some(format!("dependency '{dep}' did not succeed")),
                        ..ItemReport::new(&item.resource_id, item.action, ItemStatus::Skipped)
                    });
                    continue;
                }

                if item.action == Action::Noop && !references_moved(item, &outputs) {
                    slots[slot] = Some(ItemReport::new(&item.resource_id, item.action, ItemStatus::Noop));
                    continue;
                }

                let job = match Job::prepare(&plan.stack, item, &outputs) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!("Cannot apply {}: {e}", item.resource_id);
                        slots[slot] = Some(ItemReport::failed(&item.resource_id, item.action, 0, e.to_string()));
                        continue;
                    }
                };

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| StackError::internal(format!("Executor semaphore closed: {e}")))?;

                if self.abort.is_aborted() {
                    slots[slot] = Some(ItemReport::new(&item.resource_id, item.action, ItemStatus::Cancelled));
                    continue;
                }

                let provider = Arc::clone(&self.provider);
                let store = Arc::clone(&self.store);
                let abort = self.abort.clone();
                let policy = self.policy;

                tasks.spawn(async move {
                    let _permit = permit;
                    let report = job.run(provider.as_ref(), store.as_ref(), policy, &abort).await?;
                    Ok((slot, report))
                });
            }

            let mut commit_error = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok((slot, report))) => slots[slot] = Some(report),
                    Ok(Err(e)) => {
                        error!("State commit failed: {e}");
                        if e.is_fatal_for_stack() {
                            self.abort.abort();
                        }
                        if commit_error.is_none() {
                            commit_error = Some(e);
                        }
                    }
                    Err(e) => {
                        error!("Plan item task failed: {e}");
                        if commit_error.is_none() {
                            commit_error = Some(StackError::internal(format!("Plan item task failed: {e}")));
                        }
                    }
                }
            }
            if let Some(e) = commit_error {
                return Err(e);
            }

            for report in slots.into_iter().flatten() {
                match report.status {
                    ItemStatus::Created | ItemStatus::Updated => {
                        outputs.insert(report.resource_id.clone(), report.identifiers.clone());
                    }
                    ItemStatus::Deleted => {
                        outputs.remove(&report.resource_id);
                    }
                    ItemStatus::Failed | ItemStatus::Skipped | ItemStatus::Cancelled => {
                        unsettled.insert(report.resource_id.clone());
                    }
                    ItemStatus::Noop => {}
                }
                reports.push(report);
            }
        }

        let report = ExecutionReport {
            stack: plan.stack.clone(),
            started_at,
            finished_at: Utc::now(),
            aborted: self.abort.is_aborted(),
            items: reports,
        };

        if report.success() {
            info!("Plan for {} applied: {}", plan.stack, report.summary());
        } else {
            warn!("Plan for {} finished with problems: {}", plan.stack, report.summary());
        }

        Ok(report)
    }
}

/// A plan item ready to hand to the provider.
struct Job {
    stack: String,
    resource_id: String,
    action: Action,
    /// Declared resource, stored as applied.
    desired: Option<Resource>,
    /// Resource with references substituted, sent to the provider.
    resolved: Option<Resource>,
    prior: Option<StateRecord>,
    new_hash: String,
    depends_on: BTreeSet<String>,
    resolved_refs: BTreeMap<String, String>,
}

impl Job {
    fn prepare(
        stack: &str,
        item: &PlanItem,
        outputs: &HashMap<String, Identifiers>,
    ) -> std::result::Result<Self, PlanError> {
        let (resolved, resolved_refs) = match &item.desired {
            Some(resource) => {
                let (resolved, refs) = resolve(resource, outputs)?;
                (Some(resolved), refs)
            }
            None => (None, BTreeMap::new()),
        };
        // A no-op whose references moved is re-applied.
        let action = match item.action {
            Action::Noop => Action::Update,
            action => action,
        };

        Ok(Self {
            stack: stack.to_string(),
            resource_id: item.resource_id.clone(),
            action,
            desired: item.desired.clone(),
            resolved,
            prior: item.prior.clone(),
            new_hash: item.new_hash.clone().unwrap_or_default(),
            depends_on: item.blocked_by.clone(),
            resolved_refs,
        })
    }

    async fn run(
        self,
        provider: &dyn Provider,
        store: &dyn StateStore,
        policy: RetryPolicy,
        abort: &AbortSignal,
    ) -> Result<ItemReport> {
        let id = self.resource_id.as_str();

        match (self.action, &self.resolved, &self.prior) {
            (Action::Create, Some(resolved), _) => {
                let (outcome, attempts) = with_retry(policy, abort, id, || provider.create(resolved)).await;
                match outcome {
                    Ok(output) => self.commit(store, ItemStatus::Created, attempts, output.identifiers).await,
                    Err(e) => Ok(self.failure("create", attempts, &e)),
                }
            }
            (Action::Update, Some(resolved), Some(prior)) => {
                let (outcome, attempts) =
                    with_retry(policy, abort, id, || provider.update(resolved, prior)).await;
                match outcome {
                    Ok(output) => {
                        let mut identifiers = if prior.kind == resolved.kind {
                            prior.provider_identifiers.clone()
                        } else {
                            Identifiers::new()
                        };
                        identifiers.extend(output.identifiers);
                        self.commit(store, ItemStatus::Updated, attempts, identifiers).await
                    }
                    Err(e) => Ok(self.failure("update", attempts, &e)),
                }
            }
            (Action::Delete, _, Some(prior)) => {
                let (outcome, attempts) = with_retry(policy, abort, id, || provider.delete(prior)).await;
                match outcome {
                    Ok(()) | Err(ProviderError::NotFound { .. }) => {
                        store.delete(&self.stack, id).await?;
                        info!("Deleted {id}");
                        Ok(ItemReport {
                            attempts,
                            ..ItemReport::new(id, self.action, ItemStatus::Deleted)
                        })
                    }
                    Err(e) => Ok(self.failure("delete", attempts, &e)),
                }
            }
            (action, _, _) => Err(StackError::internal(format!(
                "Plan item {id} ({action}) is missing its resource or record"
            ))),
        }
    }

    async fn commit(
        &self,
        store: &dyn StateStore,
        status: ItemStatus,
        attempts: u32,
        identifiers: Identifiers,
    ) -> Result<ItemReport> {
        let desired = self.desired.as_ref().ok_or_else(|| {
            StackError::internal(format!("Plan item {} has no desired resource", self.resource_id))
        })?;

        let mut record = StateRecord::applied(desired, identifiers.clone(), self.new_hash.clone())
            .with_resolved_refs(self.resolved_refs.clone());
        record.depends_on.clone_from(&self.depends_on);
        store.commit(&self.stack, &self.resource_id, &record).await?;

        info!("{status:?} {}", self.resource_id);
        Ok(ItemReport {
            attempts,
            identifiers,
            ..ItemReport::new(&self.resource_id, self.action, status)
        })
    }

    fn failure(&self, verb: &str, attempts: u32, error: &ProviderError) -> ItemReport {
        warn!(
            "Failed to {verb} {} after {attempts} attempt(s): {error}",
            self.resource_id
        );
        ItemReport::failed(&self.resource_id, self.action, attempts, error.to_string())
    }
}

/// Returns true if a reference of an unchanged item now resolves to a
/// different value than when it was applied.
fn references_moved(item: &PlanItem, outputs: &HashMap<String, Identifiers>) -> bool {
    let (Some(desired), Some(prior)) = (&item.desired, &item.prior) else {
        return false;
    };
    match resolve(desired, outputs) {
        Ok((_, refs)) => refs
            .iter()
            .any(|(reference, value)| prior.resolved_refs.get(reference).is_some_and(|old| old != value)),
        Err(_) => false,
    }
}

/// Substitutes references with provider identifiers.
///
/// Also returns the value each reference resolved to.
fn resolve(
    resource: &Resource,
    outputs: &HashMap<String, Identifiers>,
) -> std::result::Result<(Resource, BTreeMap<String, String>), PlanError> {
    let mut missing: Option<Reference> = None;
    let mut resolved_refs = BTreeMap::new();
    let mut lookup = |reference: &Reference| {
        let found = outputs
            .get(&reference.resource)
            .and_then(|ids| ids.get(&reference.output));
        match found {
            Some(value) => {
                resolved_refs.insert(reference.to_string(), value.clone());
            }
            None if missing.is_none() => missing = Some(reference.clone()),
            None => {}
        }
        found.map(|v| Value::String(v.clone()))
    };

    let properties = resource
        .properties
        .iter()
        .map(|(name, value)| (name.clone(), substitute_references(value, &mut lookup)))
        .collect();

    if let Some(reference) = missing {
        return Err(PlanError::UnresolvedReference {
            resource: resource.id.clone(),
            reference: reference.to_string(),
        });
    }

    Ok((
        Resource {
            properties,
            ..resource.clone()
        },
        resolved_refs,
    ))
}

/// Calls the provider until success, a non-transient error, or the attempt
/// limit. Returns the outcome and the number of attempts made.
async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    abort: &AbortSignal,
    resource_id: &str,
    mut call: F,
) -> (std::result::Result<T, ProviderError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts && !abort.is_aborted() => {
                let delay = policy.delay_for(attempt, e.retry_after());
                warn!(
                    "Attempt {attempt}/{} for {resource_id} failed: {e}; retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                if abort.is_aborted() {
                    return (Err(e), attempt);
                }
                attempt += 1;
            }
            outcome => return (outcome, attempt),
        }
    }
}
