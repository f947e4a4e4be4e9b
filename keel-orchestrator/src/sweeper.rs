//! Stale run lock sweeper
//!
//! A run whose process died keeps its project lock until the heartbeat goes
//! stale. The sweeper reclaims such locks and closes the abandoned run so the
//! project can deploy again.

use std::time::Duration;

use keel_core::domain::run::{FailureKind, RunStatus, StageRunStatus};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::notify::Event;

/// Message stored on runs closed by the sweeper
pub const ABANDONED_MESSAGE: &str = "Run abandoned: lock heartbeat expired";

/// Spawns the periodic sweep
///
/// # Arguments
/// * `engine` - Shared engine state
/// * `stale_after` - Heartbeat age after which a lock is reclaimed
/// * `every` - Sweep period
pub fn spawn_lock_sweeper(engine: Engine, stale_after: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting lock sweeper (stale after: {:?}, interval: {:?})",
            stale_after, every
        );
        let mut interval = time::interval(every.max(Duration::from_millis(1)));
        loop {
            interval.tick().await;
            debug!("Sweeping stale run locks");
            match sweep_once(&engine, stale_after).await {
                Ok(0) => {}
                Ok(closed) => info!("Closed {} abandoned run(s)", closed),
                Err(e) => error!("Error during lock sweep: {}", e),
            }
        }
    })
}

/// Reclaims stale locks and fails the runs that held them
///
/// Returns how many runs were closed. Runs that already reached a terminal
/// status only lose their lock.
pub async fn sweep_once(engine: &Engine, stale_after: Duration) -> Result<usize> {
    let reclaimed = engine.store.sweep_stale_locks(stale_after).await?;
    let mut closed = 0;

    for lock in reclaimed {
        warn!(
            "Reclaimed stale lock of project {} held by run {}",
            lock.project_id, lock.run_id
        );

        let Some(mut run) = engine.store.find_run(lock.run_id).await? else {
            continue;
        };
        if run.status.is_terminal() {
            continue;
        }

        for mut stage in engine.store.list_stage_runs(run.id).await? {
            match stage.status {
                StageRunStatus::Running => {
                    stage.mark_failed(FailureKind::ConnectionError, ABANDONED_MESSAGE)
                }
                StageRunStatus::Pending => stage.mark_skipped(),
                _ => continue,
            }
            engine.store.update_stage_run(&stage).await?;
        }

        run.status = RunStatus::Failed;
        run.error_message = Some(ABANDONED_MESSAGE.to_string());
        run.completed_at = Some(chrono::Utc::now());
        engine.store.update_run(&run).await?;

        engine.notifier.publish(Event::RunFailed {
            run_id: run.id,
            project_id: run.project_id,
            run_number: run.run_number,
            status: run.status,
            error: run.error_message.clone(),
        });
        closed += 1;
    }

    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RunHistoryStore, RunLockStore};
    use crate::testing::{harness, project};
    use keel_core::domain::run::{PipelineRun, PipelineStageRun};
    use keel_core::domain::stage::StageType;
    use keel_runner::channel::ScriptedChannel;
    use uuid::Uuid;

    fn run(project_id: Uuid, status: RunStatus) -> PipelineRun {
        PipelineRun {
            id: Uuid::new_v4(),
            project_id,
            run_number: 7,
            branch: "main".to_string(),
            commit_sha: "abc123".to_string(),
            triggered_by: "alice".to_string(),
            status,
            error_message: None,
            created_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_closes_abandoned_run() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let build = h.add_stage("build", StageType::PreDeploy, 1, &["make"], false).await;
        let release = h.add_stage("release", StageType::Deploy, 1, &["./release"], false).await;

        let abandoned = run(h.project.id, RunStatus::Running);
        let mut running = PipelineStageRun::snapshot(abandoned.id, &build);
        running.mark_running();
        let pending = PipelineStageRun::snapshot(abandoned.id, &release);
        h.store
            .create_run(&abandoned, &[running, pending])
            .await
            .unwrap();
        assert!(h.store.try_acquire_lock(h.project.id, abandoned.id).await.unwrap());

        let mut events = h.engine.notifier.subscribe();
        assert_eq!(sweep_once(&h.engine, Duration::ZERO).await.unwrap(), 1);

        let closed = h.store.find_run(abandoned.id).await.unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Failed);
        assert_eq!(closed.error_message.as_deref(), Some(ABANDONED_MESSAGE));
        assert!(closed.completed_at.is_some());

        let stages = h.store.list_stage_runs(abandoned.id).await.unwrap();
        assert_eq!(stages[0].status, StageRunStatus::Failed);
        assert_eq!(stages[0].failure, Some(FailureKind::ConnectionError));
        assert_eq!(stages[1].status, StageRunStatus::Skipped);

        assert_eq!(events.try_recv().unwrap().name(), "run.failed");

        // The project is free again
        assert!(h.store.try_acquire_lock(h.project.id, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_locks_and_finished_runs() {
        let h = harness(project(&["web-1"]), ScriptedChannel::new());
        let finished = run(h.project.id, RunStatus::Success);
        h.store.create_run(&finished, &[]).await.unwrap();
        assert!(h.store.try_acquire_lock(h.project.id, finished.id).await.unwrap());

        assert_eq!(
            sweep_once(&h.engine, Duration::from_secs(60)).await.unwrap(),
            0
        );
        assert!(!h.store.try_acquire_lock(h.project.id, Uuid::new_v4()).await.unwrap());

        assert_eq!(sweep_once(&h.engine, Duration::ZERO).await.unwrap(), 0);
        let run = h.store.find_run(finished.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(h.store.try_acquire_lock(h.project.id, Uuid::new_v4()).await.unwrap());
    }
}
