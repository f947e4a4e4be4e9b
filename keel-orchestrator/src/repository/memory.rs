//! In-memory store
//!
//! Implements every store trait behind one mutex. Used by tests and by
//! single-process setups without a database.

use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::log::LogEntry;
use keel_core::domain::rollback::RollbackRecord;
use keel_core::domain::run::{PipelineRun, PipelineStageRun};
use keel_core::domain::stage::StageDefinition;
use keel_core::dto::page::{self, Page};
use keel_core::dto::run::RunFilter;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{
    ReclaimedLock, RepositoryError, Result, RunHistoryStore, RunLockStore, StageDefinitionStore,
    sort_stages,
};

struct RunLock {
    run_id: Uuid,
    heartbeat_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    stages: HashMap<Uuid, StageDefinition>,
    runs: Vec<PipelineRun>,
    stage_runs: Vec<PipelineStageRun>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
    /// Insertion order is creation order
    deployments: Vec<Deployment>,
    rollbacks: Vec<RollbackRecord>,
    run_counters: HashMap<Uuid, i64>,
    locks: HashMap<Uuid, RunLock>,
}

/// Store keeping everything in process memory
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StageDefinitionStore for InMemoryStore {
    async fn create_stage(&self, stage: &StageDefinition) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stages.contains_key(&stage.id) {
            return Err(RepositoryError::Conflict(format!("stage {} exists", stage.id)));
        }
        inner.stages.insert(stage.id, stage.clone());
        Ok(())
    }

    async fn update_stage(&self, stage: &StageDefinition) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.stages.get_mut(&stage.id) {
            Some(existing) => {
                *existing = stage.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_stage(&self, id: Uuid) -> Result<bool> {
        Ok(self.inner.lock().unwrap().stages.remove(&id).is_some())
    }

    async fn find_stage(&self, id: Uuid) -> Result<Option<StageDefinition>> {
        Ok(self.inner.lock().unwrap().stages.get(&id).cloned())
    }

    async fn list_stages(&self, project_id: Uuid) -> Result<Vec<StageDefinition>> {
        let inner = self.inner.lock().unwrap();
        let mut stages: Vec<StageDefinition> = inner
            .stages
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        sort_stages(&mut stages);
        Ok(stages)
    }
}

#[async_trait]
impl RunHistoryStore for InMemoryStore {
    async fn next_run_number(&self, project_id: Uuid) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.run_counters.entry(project_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn create_run(&self, run: &PipelineRun, stages: &[PipelineStageRun]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .runs
            .iter()
            .any(|r| r.project_id == run.project_id && r.run_number == run.run_number)
        {
            return Err(RepositoryError::Conflict(format!(
                "run number {} already used",
                run.run_number
            )));
        }
        inner.runs.push(run.clone());
        inner.stage_runs.extend(stages.iter().cloned());
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| RepositoryError::Missing(format!("run {}", run.id)))?;
        *existing = run.clone();
        Ok(())
    }

    async fn find_run(&self, id: Uuid) -> Result<Option<PipelineRun>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, project_id: Uuid, filter: &RunFilter) -> Result<Page<PipelineRun>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<&PipelineRun> = inner
            .runs
            .iter()
            .filter(|r| r.project_id == project_id)
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| filter.branch.as_deref().is_none_or(|b| r.branch == b))
            .filter(|r| filter.from.is_none_or(|from| r.created_at >= from))
            .filter(|r| filter.to.is_none_or(|to| r.created_at <= to))
            .collect();
        runs.sort_by(|a, b| b.run_number.cmp(&a.run_number));

        let (page, per_page) = page::normalize(filter.page, filter.per_page);
        let offset = Page::<PipelineRun>::offset(page, per_page) as usize;
        Ok(Page {
            total: runs.len() as u64,
            items: runs
                .into_iter()
                .skip(offset)
                .take(per_page as usize)
                .cloned()
                .collect(),
            page,
            per_page,
        })
    }

    async fn update_stage_run(&self, stage: &PipelineStageRun) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .stage_runs
            .iter_mut()
            .find(|s| s.id == stage.id)
            .ok_or_else(|| RepositoryError::Missing(format!("stage run {}", stage.id)))?;
        *existing = stage.clone();
        Ok(())
    }

    async fn list_stage_runs(&self, run_id: Uuid) -> Result<Vec<PipelineStageRun>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .stage_runs
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn append_logs(&self, stage_run_id: Uuid, entries: &[LogEntry]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .logs
            .entry(stage_run_id)
            .or_default()
            .extend(entries.iter().cloned());
        Ok(())
    }

    async fn list_logs(&self, stage_run_id: Uuid) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.logs.get(&stage_run_id).cloned().unwrap_or_default())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.inner.lock().unwrap().deployments.push(deployment.clone());
        Ok(())
    }

    async fn promote_deployment(&self, deployment: &Deployment, undone: Option<Uuid>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for existing in inner.deployments.iter_mut() {
            if Some(existing.id) == undone {
                existing.status = DeploymentStatus::RolledBack;
                existing.updated_at = now;
            } else if existing.project_id == deployment.project_id
                && existing.server_id == deployment.server_id
                && existing.status == DeploymentStatus::Current
            {
                existing.status = DeploymentStatus::Superseded;
                existing.updated_at = now;
            }
        }
        inner.deployments.push(deployment.clone());
        Ok(())
    }

    async fn update_deployment_status(&self, id: Uuid, status: DeploymentStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let deployment = inner
            .deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| RepositoryError::Missing(format!("deployment {}", id)))?;
        deployment.status = status;
        deployment.updated_at = Utc::now();
        Ok(())
    }

    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.deployments.iter().find(|d| d.id == id).cloned())
    }

    async fn current_deployment(&self, project_id: Uuid, server_id: &str) -> Result<Option<Deployment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deployments
            .iter()
            .find(|d| d.project_id == project_id && d.server_id == server_id && d.is_current())
            .cloned())
    }

    async fn list_deployments(&self, project_id: Uuid, server_id: Option<&str>) -> Result<Vec<Deployment>> {
        let inner = self.inner.lock().unwrap();
        let mut deployments: Vec<Deployment> = inner
            .deployments
            .iter()
            .rev()
            .filter(|d| d.project_id == project_id)
            .filter(|d| server_id.is_none_or(|s| d.server_id == s))
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn create_rollback_record(&self, record: &RollbackRecord) -> Result<()> {
        self.inner.lock().unwrap().rollbacks.push(record.clone());
        Ok(())
    }

    async fn list_rollback_records(&self, project_id: Uuid) -> Result<Vec<RollbackRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rollbacks
            .iter()
            .rev()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunLockStore for InMemoryStore {
    async fn try_acquire_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.contains_key(&project_id) {
            return Ok(false);
        }
        inner.locks.insert(
            project_id,
            RunLock {
                run_id,
                heartbeat_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn heartbeat_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get_mut(&project_id) {
            Some(lock) if lock.run_id == run_id => {
                lock.heartbeat_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, project_id: Uuid, run_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .locks
            .get(&project_id)
            .is_some_and(|lock| lock.run_id == run_id)
        {
            inner.locks.remove(&project_id);
        }
        Ok(())
    }

    async fn sweep_stale_locks(&self, stale_after: Duration) -> Result<Vec<ReclaimedLock>> {
        let Some(cutoff) = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<ReclaimedLock> = inner
            .locks
            .iter()
            .filter(|(_, lock)| lock.heartbeat_at <= cutoff)
            .map(|(project_id, lock)| ReclaimedLock {
                project_id: *project_id,
                run_id: lock.run_id,
            })
            .collect();
        for reclaimed in &stale {
            inner.locks.remove(&reclaimed.project_id);
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::run::RunStatus;
    use std::collections::BTreeMap;

    fn run(project_id: Uuid, run_number: i64, branch: &str, status: RunStatus) -> PipelineRun {
        PipelineRun {
            id: Uuid::new_v4(),
            project_id,
            run_number,
            branch: branch.to_string(),
            commit_sha: "abc123".to_string(),
            triggered_by: "manual".to_string(),
            status,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn deployment(project_id: Uuid, server: &str) -> Deployment {
        let now = Utc::now();
        Deployment {
            id: Uuid::new_v4(),
            project_id,
            server_id: server.to_string(),
            run_id: None,
            commit_sha: "abc123".to_string(),
            branch: "main".to_string(),
            status: DeploymentStatus::Current,
            triggered_by: "manual".to_string(),
            rollback_of: None,
            artifact_path: None,
            migrations: vec![],
            files: BTreeMap::new(),
            environment_snapshot: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_run_numbers_increase_per_project() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(store.next_run_number(a).await.unwrap(), 1);
        assert_eq!(store.next_run_number(a).await.unwrap(), 2);
        assert_eq!(store.next_run_number(b).await.unwrap(), 1);
        assert_eq!(store.next_run_number(a).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_paginates() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        for n in 1..=5 {
            let status = if n % 2 == 0 { RunStatus::Failed } else { RunStatus::Success };
            store
                .create_run(&run(project, n, "main", status), &[])
                .await
                .unwrap();
        }
        store
            .create_run(&run(project, 6, "feature", RunStatus::Success), &[])
            .await
            .unwrap();

        let filter = RunFilter {
            branch: Some("main".to_string()),
            per_page: Some(2),
            ..RunFilter::default()
        };
        let page = store.list_runs(project, &filter).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(
            page.items.iter().map(|r| r.run_number).collect::<Vec<_>>(),
            vec![5, 4]
        );

        let filter = RunFilter {
            status: Some(RunStatus::Failed),
            ..RunFilter::default()
        };
        let page = store.list_runs(project, &filter).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_promote_keeps_one_current_per_server() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        let first = deployment(project, "web-1");
        let other_server = deployment(project, "web-2");
        store.promote_deployment(&first, None).await.unwrap();
        store.promote_deployment(&other_server, None).await.unwrap();

        let second = deployment(project, "web-1");
        store.promote_deployment(&second, None).await.unwrap();

        let first = store.find_deployment(first.id).await.unwrap().unwrap();
        assert_eq!(first.status, DeploymentStatus::Superseded);
        let current = store.current_deployment(project, "web-1").await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert!(store.current_deployment(project, "web-2").await.unwrap().is_some());

        let restored = deployment(project, "web-1");
        store.promote_deployment(&restored, Some(second.id)).await.unwrap();
        let second = store.find_deployment(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, DeploymentStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_reclaimable() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        assert!(store.try_acquire_lock(project, run_a).await.unwrap());
        assert!(!store.try_acquire_lock(project, run_b).await.unwrap());
        assert!(store.heartbeat_lock(project, run_a).await.unwrap());
        assert!(!store.heartbeat_lock(project, run_b).await.unwrap());

        assert!(
            store
                .sweep_stale_locks(Duration::from_secs(60))
                .await
                .unwrap()
                .is_empty()
        );
        let reclaimed = store.sweep_stale_locks(Duration::ZERO).await.unwrap();
        assert_eq!(
            reclaimed,
            vec![ReclaimedLock {
                project_id: project,
                run_id: run_a
            }]
        );
        assert!(store.try_acquire_lock(project, run_b).await.unwrap());

        store.release_lock(project, run_a).await.unwrap();
        assert!(!store.try_acquire_lock(project, run_a).await.unwrap());
        store.release_lock(project, run_b).await.unwrap();
        assert!(store.try_acquire_lock(project, run_a).await.unwrap());
    }
}
