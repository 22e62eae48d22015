//! Generic dependency-graph task executor.
//!
//! Ported from Glassdome's `OrchestrationEngine`: a DAG scheduler that
//! knows nothing about VMs, networks, or any other domain concept. Tasks
//! carry an opaque JSON payload and a list of prerequisite task ids; the
//! engine's only job is running them in dependency order with bounded
//! parallelism.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task id already exists: {0}")]
    DuplicateId(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// The outcome an executor reports for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Runs a single task. Invoked concurrently across tasks, never for two
/// tasks whose dependency order hasn't been satisfied.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task_id: &str, payload: &serde_json::Value) -> TaskOutcome;
}

#[derive(Debug, Clone)]
struct Task {
    payload: serde_json::Value,
    dependencies: Vec<String>,
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub error: Option<String>,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub duration_seconds: f64,
    pub tasks: HashMap<String, TaskReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub percentage: u32,
}

/// A dependency-graph task set and its execution state.
#[derive(Default)]
pub struct Engine {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    /// dependency id -> ids that depend on it
    graph: HashMap<String, Vec<String>>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    running: HashSet<String>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. `dependencies` may reference task ids added later;
    /// the full graph is validated when `run` is called.
    pub fn add_task(
        &mut self,
        task_id: impl Into<String>,
        payload: serde_json::Value,
        dependencies: Vec<String>,
    ) -> Result<()> {
        let task_id = task_id.into();
        if self.tasks.contains_key(&task_id) {
            return Err(EngineError::DuplicateId(task_id));
        }

        for dep in &dependencies {
            self.graph.entry(dep.clone()).or_default().push(task_id.clone());
        }

        self.order.push(task_id.clone());
        self.tasks.insert(
            task_id,
            Task {
                payload,
                dependencies,
                status: TaskStatus::Pending,
                result: None,
                error: None,
            },
        );
        Ok(())
    }

    /// Tasks eligible to launch: still `Pending`, or already flagged
    /// `Ready` from an earlier call that found more ready tasks than
    /// `max_parallel` had room to launch. Re-including `Ready` tasks here
    /// is what keeps them launchable on a later iteration instead of
    /// being stranded once `ready_tasks` stops considering them.
    fn ready_tasks(&mut self) -> Vec<String> {
        let mut ready = Vec::new();
        for task_id in &self.order {
            let task = self.tasks.get(task_id).expect("registered task");
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            let deps_completed = task
                .dependencies
                .iter()
                .all(|dep| self.completed.contains(dep));
            if deps_completed {
                ready.push(task_id.clone());
            }
        }
        for task_id in &ready {
            self.tasks.get_mut(task_id).unwrap().status = TaskStatus::Ready;
        }
        ready
    }

    fn has_cycle(&self) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut rec_stack: HashSet<&str> = HashSet::new();

        fn visit<'a>(
            node: &'a str,
            graph: &'a HashMap<String, Vec<String>>,
            visited: &mut HashSet<&'a str>,
            rec_stack: &mut HashSet<&'a str>,
        ) -> bool {
            visited.insert(node);
            rec_stack.insert(node);

            if let Some(neighbors) = graph.get(node) {
                for neighbor in neighbors {
                    if !visited.contains(neighbor.as_str()) {
                        if visit(neighbor, graph, visited, rec_stack) {
                            return true;
                        }
                    } else if rec_stack.contains(neighbor.as_str()) {
                        return true;
                    }
                }
            }

            rec_stack.remove(node);
            false
        }

        for task_id in &self.order {
            if !visited.contains(task_id.as_str())
                && visit(task_id, &self.graph, &mut visited, &mut rec_stack)
            {
                return true;
            }
        }
        false
    }

    /// Layers of tasks, each executable in parallel given the previous
    /// layers have completed. Empty if the graph has a cycle.
    pub fn execution_plan(&self) -> Vec<Vec<String>> {
        if self.has_cycle() {
            return Vec::new();
        }

        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.tasks[id].dependencies.len()))
            .collect();

        let mut layers = Vec::new();
        let mut frontier: Vec<String> = self
            .order
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .cloned()
            .collect();

        while !frontier.is_empty() {
            layers.push(frontier.clone());
            let mut next_frontier = Vec::new();
            for task_id in &frontier {
                if let Some(dependents) = self.graph.get(task_id) {
                    for dependent in dependents {
                        let degree = in_degree.get_mut(dependent.as_str()).unwrap();
                        *degree -= 1;
                        if *degree == 0 {
                            next_frontier.push(dependent.clone());
                        }
                    }
                }
            }
            frontier = next_frontier;
        }

        layers
    }

    pub fn progress(&self) -> Progress {
        let total = self.tasks.len();
        let completed = self.completed.len();
        let failed = self.failed.len();
        let running = self.running.len();
        let pending = total.saturating_sub(completed + failed + running);
        let percentage = if total > 0 {
            ((completed + failed) * 100 / total) as u32
        } else {
            0
        };
        Progress {
            total,
            completed,
            failed,
            running,
            pending,
            percentage,
        }
    }

    fn snapshot(&self) -> HashMap<String, TaskReport> {
        self.tasks
            .iter()
            .map(|(id, task)| {
                (
                    id.clone(),
                    TaskReport {
                        status: task.status,
                        result: task.result.clone(),
                        error: task.error.clone(),
                    },
                )
            })
            .collect()
    }

    /// Run every registered task to completion (or failure), respecting
    /// dependency order. `max_parallel` bounds concurrently-running tasks;
    /// `fail_fast` cancels in-flight tasks as soon as any task fails.
    pub async fn run(
        &mut self,
        executor: Arc<dyn TaskExecutor>,
        max_parallel: usize,
        fail_fast: bool,
    ) -> RunReport {
        let max_parallel = max_parallel.max(1);
        tracing::info!(tasks = self.tasks.len(), "starting orchestration run");
        let start = Instant::now();

        if self.has_cycle() {
            return RunReport {
                success: false,
                error: Some("Circular dependencies detected".to_string()),
                total_tasks: self.tasks.len(),
                completed: 0,
                failed: 0,
                duration_seconds: start.elapsed().as_secs_f64(),
                tasks: self.snapshot(),
            };
        }

        let mut join_set: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut stuck_error: Option<String> = None;

        while self.completed.len() + self.failed.len() < self.tasks.len() {
            let ready = self.ready_tasks();
            for task_id in ready {
                if self.running.len() >= max_parallel {
                    break;
                }
                self.tasks.get_mut(&task_id).unwrap().status = TaskStatus::Running;
                self.running.insert(task_id.clone());

                let payload = self.tasks[&task_id].payload.clone();
                let exec = executor.clone();
                let tid = task_id.clone();
                tracing::info!(task = %tid, "executing task");
                join_set.spawn(async move {
                    let outcome = exec.execute(&tid, &payload).await;
                    (tid, outcome)
                });
            }

            if self.running.is_empty() {
                stuck_error = Some("no tasks can be executed - dependency issue".to_string());
                break;
            }

            match join_set.join_next().await {
                Some(Ok((task_id, outcome))) => {
                    self.running.remove(&task_id);
                    let task = self.tasks.get_mut(&task_id).unwrap();
                    task.result = outcome.data.clone();
                    if outcome.success {
                        task.status = TaskStatus::Completed;
                        self.completed.insert(task_id.clone());
                        tracing::info!(task = %task_id, "task completed successfully");
                    } else {
                        task.status = TaskStatus::Failed;
                        task.error = outcome.error.clone();
                        self.failed.insert(task_id.clone());
                        tracing::error!(task = %task_id, error = ?outcome.error, "task failed");
                    }
                }
                Some(Err(join_err)) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    tracing::error!(error = %join_err, "task panicked");
                }
                None => break,
            }

            if fail_fast && !self.failed.is_empty() {
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                for task_id in self.running.drain() {
                    self.tasks.get_mut(&task_id).unwrap().status = TaskStatus::Skipped;
                }
                break;
            }
        }

        join_set.abort_all();

        let duration = start.elapsed();
        let success = self.failed.is_empty() && stuck_error.is_none();
        let report = RunReport {
            success,
            error: stuck_error,
            total_tasks: self.tasks.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            duration_seconds: duration.as_secs_f64(),
            tasks: self.snapshot(),
        };

        tracing::info!(
            completed = report.completed,
            total = report.total_tasks,
            duration = ?duration,
            "orchestration run finished"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysSucceed;

    #[async_trait]
    impl TaskExecutor for AlwaysSucceed {
        async fn execute(&self, task_id: &str, _payload: &serde_json::Value) -> TaskOutcome {
            TaskOutcome::ok(serde_json::json!({ "task_id": task_id }))
        }
    }

    struct FailsOne {
        failing: &'static str,
    }

    #[async_trait]
    impl TaskExecutor for FailsOne {
        async fn execute(&self, task_id: &str, _payload: &serde_json::Value) -> TaskOutcome {
            if task_id == self.failing {
                TaskOutcome::fail("boom")
            } else {
                TaskOutcome::ok(serde_json::json!({}))
            }
        }
    }

    fn simple_dag(engine: &mut Engine) {
        engine
            .add_task("n1", serde_json::json!({}), vec![])
            .unwrap();
        engine
            .add_task("v1", serde_json::json!({}), vec!["n1".into()])
            .unwrap();
        engine
            .add_task("v2", serde_json::json!({}), vec!["n1".into()])
            .unwrap();
        engine
            .add_task("v3", serde_json::json!({}), vec!["v1".into(), "v2".into()])
            .unwrap();
    }

    #[tokio::test]
    async fn s1_simple_dag_completes_in_layers() {
        let mut engine = Engine::new();
        simple_dag(&mut engine);

        let plan = engine.execution_plan();
        assert_eq!(
            plan,
            vec![
                vec!["n1".to_string()],
                vec!["v1".to_string(), "v2".to_string()],
                vec!["v3".to_string()],
            ]
        );

        let report = engine.run(Arc::new(AlwaysSucceed), 2, true).await;
        assert!(report.success);
        assert_eq!(report.completed, 4);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn s2_fail_fast_stops_downstream_tasks() {
        let mut engine = Engine::new();
        simple_dag(&mut engine);

        let report = engine
            .run(Arc::new(FailsOne { failing: "v1" }), 2, true)
            .await;

        assert!(!report.success);
        assert_eq!(report.failed, 1);
        let v3 = &report.tasks["v3"];
        assert_ne!(v3.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn s3_cycle_is_rejected_without_running_executor() {
        let mut engine = Engine::new();
        engine
            .add_task("a", serde_json::json!({}), vec!["c".into()])
            .unwrap();
        engine
            .add_task("b", serde_json::json!({}), vec!["a".into()])
            .unwrap();
        engine
            .add_task("c", serde_json::json!({}), vec!["b".into()])
            .unwrap();

        let report = engine.run(Arc::new(AlwaysSucceed), 2, false).await;
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("Circular dependencies detected"));
        assert_eq!(report.completed, 0);
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let mut engine = Engine::new();
        engine.add_task("a", serde_json::json!({}), vec![]).unwrap();
        let err = engine.add_task("a", serde_json::json!({}), vec![]).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(id) if id == "a"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_max_parallel() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        struct TrackingExecutor {
            concurrent: Arc<AtomicUsize>,
            max_seen: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl TaskExecutor for TrackingExecutor {
            async fn execute(&self, _task_id: &str, _payload: &serde_json::Value) -> TaskOutcome {
                let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                TaskOutcome::ok(serde_json::json!({}))
            }
        }

        let mut engine = Engine::new();
        for i in 0..8 {
            engine
                .add_task(format!("t{i}"), serde_json::json!({}), vec![])
                .unwrap();
        }

        let report = engine
            .run(
                Arc::new(TrackingExecutor {
                    concurrent: concurrent.clone(),
                    max_seen: max_seen.clone(),
                }),
                3,
                false,
            )
            .await;

        assert!(report.success);
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn unknown_prerequisite_is_reported_not_infinite_looped() {
        let mut engine = Engine::new();
        engine
            .add_task("a", serde_json::json!({}), vec!["ghost".into()])
            .unwrap();

        let report = engine.run(Arc::new(AlwaysSucceed), 2, false).await;
        assert!(!report.success);
        assert_eq!(
            report.error.as_deref(),
            Some("no tasks can be executed - dependency issue")
        );
    }

    #[test]
    fn progress_reports_percentage() {
        let engine = Engine::new();
        let progress = engine.progress();
        assert_eq!(progress.total, 0);
        assert_eq!(progress.percentage, 0);
    }
}
