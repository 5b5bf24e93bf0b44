//! Stack engine.
//!
//! This module ties the pieces of a run together: it materializes the stack
//! from the declaration document, builds the dependency graph, plans against
//! recorded state, and executes plans under the stack lock.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, StackDocument};
use crate::error::{Result, StackError, StateError};
use crate::graph::{DependencyGraph, Wave};
use crate::model::Stack;
use crate::planner::{AbortSignal, ExecutionReport, Plan, PlanExecutor};
use crate::provider::Provider;
use crate::state::{
    generate_holder_id, HistoryEntry, LockInfo, RunOperation, StackState, StateRecord, StateStore,
};

/// Options for an apply run.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Restrict the run to a resource and its dependencies.
    pub target: Option<String>,
    /// Override of `executor.max_parallel`.
    pub parallelism: Option<usize>,
    /// Lock holder id; generated when absent.
    pub holder: Option<String>,
    /// Cancellation flag.
    pub abort: AbortSignal,
}

/// Result of an apply run.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The plan that was computed.
    pub plan: Plan,
    /// Execution report; `None` when there was nothing to do or the plan
    /// was not confirmed.
    pub report: Option<ExecutionReport>,
}

impl ApplyOutcome {
    /// Returns true unless an executed plan had problems.
    #[must_use]
    pub fn success(&self) -> bool {
        self.report.as_ref().is_none_or(ExecutionReport::success)
    }
}

/// Engine for one stack.
pub struct Engine {
    /// Declaration document.
    document: StackDocument,
    /// Materialized stack.
    stack: Stack,
    /// Dependency graph, wiring patches applied.
    graph: DependencyGraph,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider.
    provider: Arc<dyn Provider>,
    /// Hash of the declaration document.
    document_hash: String,
}

impl Engine {
    /// Creates an engine from a validated declaration document.
    ///
    /// # Errors
    ///
    /// Returns a declaration error for duplicate ids, unknown dependencies,
    /// references or patch targets, and a cycle error if the graph is not
    /// acyclic.
    pub fn new(
        document: StackDocument,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        let stack = Stack::build(&document.settings(), &document.resources)?;
        let graph = DependencyGraph::build_with_patches(&stack, &document.wiring)?;
        let document_hash = ConfigHasher::new().hash_document(&document);

        debug!(
            "Engine ready for {} ({} resources, {} waves, provider {}, {} state)",
            stack.id(),
            graph.len(),
            graph.waves().len(),
            provider.name(),
            store.backend_type()
        );

        Ok(Self {
            document,
            stack,
            graph,
            store,
            provider,
            document_hash,
        })
    }

    /// Returns the stack id.
    #[must_use]
    pub fn stack_id(&self) -> &str {
        self.stack.id()
    }

    /// Returns the materialized stack.
    #[must_use]
    pub const fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Returns the dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Returns the declaration document.
    #[must_use]
    pub const fn document(&self) -> &StackDocument {
        &self.document
    }

    /// Returns the hash of the declaration document.
    #[must_use]
    pub fn document_hash(&self) -> &str {
        &self.document_hash
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Returns the waves, optionally scoped to a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is not a present resource.
    pub fn waves(&self, target: Option<&str>) -> Result<Vec<Wave>> {
        match target {
            Some(id) => Ok(self.graph.scope_to_target(id)?),
            None => Ok(self.graph.waves().to_vec()),
        }
    }

    /// Loads the recorded state of the stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or is corrupted.
    pub async fn state(&self) -> Result<Option<StackState>> {
        self.store.load_state(self.stack_id()).await
    }

    /// Computes a plan against recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or the target is unknown.
    pub async fn plan(&self, target: Option<&str>) -> Result<Plan> {
        let records = self.store.load(self.stack_id()).await?;
        Plan::build(&self.stack, &self.graph, &records, target, &self.document_hash)
    }

    /// Executes a plan and records the run in the stack history.
    ///
    /// Does not take the stack lock; see [`Engine::apply`].
    ///
    /// # Errors
    ///
    /// Returns an error if the plan belongs to another stack, or on a
    /// state failure during execution.
    pub async fn execute(&self, plan: &Plan, options: &ApplyOptions) -> Result<ExecutionReport> {
        if plan.stack != self.stack_id() {
            return Err(StackError::internal(format!(
                "Plan for stack '{}' cannot be applied to '{}'",
                plan.stack,
                self.stack_id()
            )));
        }

        let mut executor = PlanExecutor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            &self.document.executor,
        )
        .with_abort_signal(options.abort.clone());
        if let Some(parallelism) = options.parallelism {
            executor = executor.with_parallelism(parallelism);
        }

        let report = executor.execute(plan).await?;

        let entry = if report.success() {
            HistoryEntry::new(RunOperation::Apply, &self.document_hash, report.changed())
        } else {
            let summary = report.summary();
            let message = report.first_error().map_or_else(
                || format!("{} items did not complete", summary.skipped + summary.cancelled),
                ToString::to_string,
            );
            HistoryEntry::failed(RunOperation::Apply, &self.document_hash, report.changed(), &message)
        };
        self.store.append_history(self.stack_id(), entry).await?;

        Ok(report)
    }

    /// Plans and executes under the stack lock.
    ///
    /// `confirm` sees the plan before anything is executed; returning false
    /// ends the run without changes. Plans without changes are not
    /// executed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held by someone else, or if
    /// planning or execution fails. The lock is released in every case.
    pub async fn apply<F>(&self, options: &ApplyOptions, confirm: F) -> Result<ApplyOutcome>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let holder = options.holder.clone().unwrap_or_else(generate_holder_id);
        let lock = self.lock(&holder).await?;

        let outcome = self.apply_locked(options, confirm).await;

        if let Err(e) = self.store.release_lock(self.stack_id(), &lock.lock_id).await {
            error!("Failed to release lock on {}: {e}", self.stack_id());
            if outcome.is_ok() {
                return Err(e);
            }
        }

        outcome
    }

    async fn apply_locked<F>(&self, options: &ApplyOptions, confirm: F) -> Result<ApplyOutcome>
    where
        F: FnOnce(&Plan) -> bool,
    {
        let plan = self.plan(options.target.as_deref()).await?;

        if !plan.has_changes() {
            info!("No changes required for {}", self.stack_id());
            return Ok(ApplyOutcome { plan, report: None });
        }

        if !confirm(&plan) {
            info!("Apply of {} not confirmed", self.stack_id());
            return Ok(ApplyOutcome { plan, report: None });
        }

        let report = self.execute(&plan, options).await?;
        Ok(ApplyOutcome {
            plan,
            report: Some(report),
        })
    }

    /// Drops the record of a resource without touching the provider.
    ///
    /// Returns the removed record, or `None` if nothing was recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held by someone else or state cannot
    /// be written.
    pub async fn forget(&self, resource_id: &str) -> Result<Option<StateRecord>> {
        let lock = self.lock(&generate_holder_id()).await?;

        let outcome = async {
            let record = self.store.load(self.stack_id()).await?.remove(resource_id);
            if record.is_some() {
                self.store.delete(self.stack_id(), resource_id).await?;
                self.store
                    .append_history(
                        self.stack_id(),
                        HistoryEntry::new(
                            RunOperation::Forget,
                            &self.document_hash,
                            vec![resource_id.to_string()],
                        ),
                    )
                    .await?;
                warn!("Forgot {resource_id}; the provider resource is left in place");
            }
            Ok(record)
        }
        .await;

        self.store.release_lock(self.stack_id(), &lock.lock_id).await?;
        outcome
    }

    /// Acquires the stack lock.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockedByOther`] if another holder has an
    /// unexpired lock.
    pub async fn lock(&self, holder: &str) -> Result<LockInfo> {
        let lock = self.store.acquire_lock(self.stack_id(), holder).await?;
        debug!("Locked {} as {holder} ({})", self.stack_id(), lock.lock_id);
        Ok(lock)
    }

    /// Releases the stack lock.
    ///
    /// With `force`, any lock is removed regardless of its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub async fn unlock(&self, lock_id: Option<&str>, force: bool) -> Result<()> {
        match (lock_id, force) {
            (_, true) => self.store.force_unlock(self.stack_id()).await,
            (Some(id), false) => self.store.release_lock(self.stack_id(), id).await,
            (None, false) => Err(StackError::State(StateError::LockFailed {
                message: String::from("a lock id is required unless forcing"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::ProviderError;
    use crate::planner::{Action, ItemStatus};
    use crate::provider::{ProviderAction, SimulatedProvider};
    use crate::state::MemoryStateStore;

    const DOC: &str = r"
stack:
  name: shop
  environment: dev
  tags:
    Project: shop
executor:
  max_parallel: 2
  max_attempts: 3
  initial_backoff_ms: 1
  max_backoff_ms: 4
resources:
  - id: a
    kind: custom
    properties:
      size: 1
  - id: b
    kind: custom
    depends_on: [a]
    properties:
      parent: ${a}
  - id: c
    kind: custom
    depends_on: [a]
    properties:
      size: 3
";

    fn document(yaml: &str) -> StackDocument {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    struct Harness {
        provider: Arc<SimulatedProvider>,
        store: Arc<MemoryStateStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                provider: Arc::new(SimulatedProvider::new()),
                store: Arc::new(MemoryStateStore::new()),
            }
        }

        fn engine(&self, yaml: &str) -> Engine {
            Engine::new(document(yaml), self.store.clone(), self.provider.clone()).unwrap()
        }

        async fn apply(&self, yaml: &str) -> ApplyOutcome {
            self.engine(yaml)
                .apply(&ApplyOptions::default(), |_| true)
                .await
                .unwrap()
        }
    }

    fn actions(plan: &Plan) -> Vec<Vec<(&str, Action)>> {
        plan.waves
            .iter()
            .map(|w| w.items.iter().map(|i| (i.resource_id.as_str(), i.action)).collect())
            .collect()
    }

    #[tokio::test]
    async fn test_waves_follow_dependencies() {
        let h = Harness::new();
        let plan = h.engine(DOC).plan(None).await.unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                vec![("a", Action::Create)],
                vec![("b", Action::Create), ("c", Action::Create)],
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let h = Harness::new();
        let first = h.apply(DOC).await;
        assert!(first.success());
        assert_eq!(first.report.unwrap().summary().created, 3);

        let second = h.apply(DOC).await;
        assert!(second.report.is_none());
        assert!(!second.plan.has_changes());
        assert_eq!(second.plan.summary().noop, 3);
        assert_eq!(h.provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let only_a = r"
stack:
  name: shop
resources:
  - id: a
    kind: custom
";
        let empty = r"
stack:
  name: shop
";
        let h = Harness::new();
        let first = h.apply(only_a).await;
        assert_eq!(actions(&first.plan), vec![vec![("a", Action::Create)]]);

        let second = h.apply(empty).await;
        assert_eq!(actions(&second.plan), vec![vec![("a", Action::Delete)]]);
        assert!(second.success());
        assert!(h.store.load("shop-dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_isolated_from_sibling() {
        let h = Harness::new();
        h.apply(DOC).await;

        let changed = DOC.replace("size: 1", "size: 1\n      note: x").replace("size: 3", "size: 4");
        let changed = changed.replace("parent: ${a}", "parent: ${a}\n      replicas: 2");
        h.provider.fail_always("b", ProviderError::permanent("b", "rejected"));

        let outcome = h.apply(&changed).await;
        let report = outcome.report.unwrap();
        assert!(!report.success());
        assert_eq!(report.item("b").unwrap().status, ItemStatus::Failed);
        assert_eq!(report.item("c").unwrap().status, ItemStatus::Updated);

        let state = h.engine(&changed).state().await.unwrap().unwrap();
        let last = state.history.last().unwrap();
        assert!(!last.success);
        assert!(last.error.as_deref().unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_dependents_of_failure_skipped() {
        let h = Harness::new();
        h.provider.fail_always("a", ProviderError::permanent("a", "quota exceeded"));

        let report = h.apply(DOC).await.report.unwrap();
        assert_eq!(report.item("a").unwrap().status, ItemStatus::Failed);
        assert_eq!(report.item("b").unwrap().status, ItemStatus::Skipped);
        assert_eq!(report.item("c").unwrap().status, ItemStatus::Skipped);
        assert_eq!(h.provider.call_count("b"), 0);
    }

    #[tokio::test]
    async fn test_transient_error_retried_then_applied() {
        let h = Harness::new();
        h.provider.fail_next("c", ProviderError::transient("c", "throttled"));
        h.provider.fail_next("c", ProviderError::transient("c", "throttled"));

        let report = h.apply(DOC).await.report.unwrap();
        assert!(report.success());
        assert_eq!(report.item("c").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_no_partial_records() {
        let h = Harness::new();
        let options = ApplyOptions::default();
        options.abort.abort();

        let outcome = h.engine(DOC).apply(&options, |_| true).await.unwrap();
        assert_eq!(outcome.report.unwrap().summary().cancelled, 3);
        assert!(h.store.load("shop-dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_state_aborts_before_provider() {
        let h = Harness::new();
        h.store.put_raw("shop-dev", "{ definitely not state");

        let err = h
            .engine(DOC)
            .apply(&ApplyOptions::default(), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
        assert!(err.is_fatal_for_stack());
        assert!(h.provider.calls().is_empty());
        assert!(!h.store.is_locked("shop-dev").await.unwrap());
    }

    #[tokio::test]
    async fn test_unconfirmed_apply_changes_nothing() {
        let h = Harness::new();
        let outcome = h
            .engine(DOC)
            .apply(&ApplyOptions::default(), |_| false)
            .await
            .unwrap();
        assert!(outcome.report.is_none());
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_locked_stack_rejects_apply() {
        let h = Harness::new();
        let engine = h.engine(DOC);
        let lock = engine.lock("someone-else").await.unwrap();

        let err = engine
            .apply(&ApplyOptions::default(), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::State(StateError::LockedByOther { .. })));

        engine.unlock(Some(&lock.lock_id), false).await.unwrap();
        assert!(engine.apply(&ApplyOptions::default(), |_| true).await.is_ok());
    }

    #[tokio::test]
    async fn test_target_applies_dependencies_only() {
        let h = Harness::new();
        let options = ApplyOptions {
            target: Some(String::from("b")),
            ..ApplyOptions::default()
        };
        let outcome = h.engine(DOC).apply(&options, |_| true).await.unwrap();
        assert_eq!(outcome.report.unwrap().summary().created, 2);
        assert_eq!(h.provider.call_count("c"), 0);
    }

    #[tokio::test]
    async fn test_optional_component_and_wiring() {
        let yaml = r"
stack:
  name: shop
flags:
  enable_waf: false
resources:
  - id: waf
    kind: web_acl
    enabled_if: enable_waf
  - id: alb
    kind: load_balancer
  - id: cdn
    kind: distribution
    properties:
      origin: ${alb.dns_name}
      web_acl: ${waf.arn}
  - id: svc
    kind: service
wiring:
  - resource: svc
    depends_on: [alb, waf]
";
        let h = Harness::new();
        let outcome = h.apply(yaml).await;
        assert_eq!(
            actions(&outcome.plan),
            vec![
                vec![("alb", Action::Create)],
                vec![("cdn", Action::Create), ("svc", Action::Create)],
            ]
        );

        let records = h.store.load("shop-dev").await.unwrap();
        assert!(!records.contains_key("waf"));
        assert!(records["cdn"].applied_properties["web_acl"].is_null());

        let cdn = h
            .provider
            .calls()
            .into_iter()
            .find(|c| c.resource_id == "cdn")
            .unwrap();
        let dns = records["alb"].identifier("dns_name").unwrap();
        assert_eq!(cdn.properties["origin"], serde_json::json!(dns));
    }

    #[tokio::test]
    async fn test_stack_tags_reach_the_provider() {
        let h = Harness::new();
        h.apply(DOC).await;
        let call = h.provider.calls().into_iter().next().unwrap();
        assert_eq!(call.properties["tags"]["Project"], "shop");
    }

    #[tokio::test]
    async fn test_forget_drops_record_only() {
        let h = Harness::new();
        h.apply(DOC).await;
        let engine = h.engine(DOC);

        let removed = engine.forget("c").await.unwrap();
        assert!(removed.is_some());
        assert!(engine.forget("c").await.unwrap().is_none());

        let plan = engine.plan(None).await.unwrap();
        assert_eq!(plan.item("c").unwrap().action, Action::Create);
        assert_eq!(h.provider.call_count("c"), 1);
    }

    #[tokio::test]
    async fn test_init_template_applies_cleanly() {
        let yaml = include_str!("../templates/halldyll.stack.yaml");
        let h = Harness::new();

        let outcome = h.apply(yaml).await;
        let report = outcome.report.unwrap();
        assert!(report.success(), "{report:?}");
        assert!(report.item("waf").is_none());
        assert_eq!(report.item("cdn").unwrap().status, ItemStatus::Created);

        let plan = h.engine(yaml).plan(None).await.unwrap();
        assert!(!plan.has_changes());
    }

    #[tokio::test]
    async fn test_recreated_resource_rewires_dependents() {
        let h = Harness::new();
        h.apply(DOC).await;
        let old_a = h.store.load("shop-dev").await.unwrap()["a"]
            .primary_id()
            .unwrap()
            .to_string();

        assert!(h.engine(DOC).forget("a").await.unwrap().is_some());
        let outcome = h.apply(DOC).await;
        assert!(outcome.success());
        assert_eq!(outcome.plan.item("a").unwrap().action, Action::Create);
        assert_eq!(outcome.plan.item("b").unwrap().action, Action::Update);
        assert_eq!(outcome.plan.item("c").unwrap().action, Action::Noop);

        let records = h.store.load("shop-dev").await.unwrap();
        let new_a = records["a"].primary_id().unwrap();
        assert_ne!(new_a, old_a);

        let b = h
            .provider
            .calls()
            .into_iter()
            .rev()
            .find(|c| c.resource_id == "b")
            .unwrap();
        assert_eq!(b.action, ProviderAction::Update);
        assert_eq!(b.properties["parent"], serde_json::json!(new_a));

        assert!(!h.engine(DOC).plan(None).await.unwrap().has_changes());
    }

    #[tokio::test]
    async fn test_disabling_component_detaches_before_delete() {
        let doc = |enabled: bool| {
            format!(
                r"
stack:
  name: shop
flags:
  enable_waf: {enabled}
resources:
  - id: waf
    kind: web_acl
    enabled_if: enable_waf
  - id: cdn
    kind: distribution
    properties:
      web_acl: ${{waf.arn}}
"
            )
        };
        let h = Harness::new();
        assert!(h.apply(&doc(true)).await.success());

        let outcome = h.apply(&doc(false)).await;
        assert!(outcome.success());
        assert_eq!(
            actions(&outcome.plan),
            vec![vec![("cdn", Action::Update)], vec![("waf", Action::Delete)]]
        );

        let tail: Vec<(String, ProviderAction)> = h
            .provider
            .calls()
            .into_iter()
            .skip(2)
            .map(|c| (c.resource_id, c.action))
            .collect();
        assert_eq!(
            tail,
            vec![
                (String::from("cdn"), ProviderAction::Update),
                (String::from("waf"), ProviderAction::Delete),
            ]
        );
        assert!(h.store.load("shop-dev").await.unwrap()["cdn"].applied_properties["web_acl"].is_null());
    }
}
