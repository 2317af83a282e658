//! 两种存储后端上运行同一组场景，行为必须一致

use archivist_core::{DatabaseConfig, SchedulerError};
use archivist_domain::entities::{AssetCounts, Job, JobState, TaskFilter, TaskState};
use archivist_domain::value_objects::StateChange;
use archivist_infrastructure::{DatabaseManager, RepositorySet};
use archivist_testing_utils::{AnalystBuilder, JobSpecBuilder, TaskSpecBuilder, TestEnv};
use chrono::Utc;
use uuid::Uuid;

async fn backends() -> Vec<(&'static str, RepositorySet)> {
    let sqlite = DatabaseManager::new(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();

    vec![
        ("memory", RepositorySet::in_memory()),
        ("sqlite", sqlite.repositories()),
    ]
}

async fn create_job(repos: &RepositorySet, priority: i32) -> Job {
    let job = JobSpecBuilder::new().with_priority(priority).build_job();
    repos.jobs.create(&job, &[]).await.unwrap()
}

#[tokio::test]
async fn test_task_lifecycle_keeps_counts_consistent() {
    for (name, repos) in backends().await {
        let job = create_job(&repos, 0).await;
        let parent = TaskSpecBuilder::new("parent").with_assets(2).build_for(&job);
        let child = TaskSpecBuilder::new("child")
            .depends_on(parent.id)
            .build_for(&job);
        repos
            .tasks
            .create_batch(&[parent.clone(), child.clone()])
            .await
            .unwrap();

        let claimed = repos
            .tasks
            .claim(parent.id, "render-1:5000", Utc::now())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{name}: claim failed"));
        assert_eq!(claimed.state, TaskState::Queued);

        for (from, to) in [
            (TaskState::Queued, TaskState::Running),
            (TaskState::Running, TaskState::Success),
        ] {
            let change = StateChange::new(parent.id, from, to)
                .with_host("render-1:5000")
                .with_asset_delta(AssetCounts {
                    created: i64::from(to == TaskState::Success) * 2,
                    ..Default::default()
                });
            assert!(
                repos.tasks.apply_state_change(&change).await.unwrap().is_some(),
                "{name}: {from} -> {to}"
            );
        }

        let dependents = repos.tasks.find_dependents(parent.id).await.unwrap();
        assert_eq!(dependents.len(), 1, "{name}");

        let job = repos.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.task_counts.success, 1, "{name}");
        assert_eq!(job.task_counts.depend, 1, "{name}");
        assert_eq!(job.task_counts.total(), 2, "{name}");
        assert_eq!(job.asset_counts.created, 2, "{name}");
        assert_eq!(job.asset_counts.total, 2, "{name}");

        let all = repos.tasks.list(&TaskFilter::for_job(job.id)).await.unwrap();
        assert_eq!(all.len(), job.task_counts.total() as usize, "{name}");
    }
}

#[tokio::test]
async fn test_candidates_follow_priority() {
    for (name, repos) in backends().await {
        let low = create_job(&repos, 1).await;
        let high = create_job(&repos, 9).await;
        let low_task = TaskSpecBuilder::new("low").build_for(&low);
        let high_task = TaskSpecBuilder::new("high").build_for(&high);
        repos.tasks.create_batch(&[low_task.clone()]).await.unwrap();
        repos.tasks.create_batch(&[high_task.clone()]).await.unwrap();

        let candidates = repos.tasks.dispatch_candidates(10).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high_task.id, low_task.id], "{name}");
    }
}

#[tokio::test]
async fn test_orphans_use_ping_time() {
    for (name, repos) in backends().await {
        let job = create_job(&repos, 0).await;
        let task = TaskSpecBuilder::new("a").build_for(&job);
        repos.tasks.create_batch(&[task.clone()]).await.unwrap();
        repos
            .tasks
            .claim(task.id, "h:1", TestEnv::timestamp_with_offset(-600))
            .await
            .unwrap();

        let orphans = repos
            .tasks
            .find_orphans(TestEnv::timestamp_with_offset(-60))
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1, "{name}");
        assert_eq!(orphans[0].host.as_deref(), Some("h:1"), "{name}");
    }
}

#[tokio::test]
async fn test_analyst_records() {
    for (name, repos) in backends().await {
        let stale = AnalystBuilder::new("stale")
            .with_last_ping(TestEnv::timestamp_with_offset(-3600))
            .build();
        let fresh = AnalystBuilder::new("fresh").locked().build();
        repos.analysts.upsert(&stale).await.unwrap();
        let stored = repos.analysts.upsert(&fresh).await.unwrap();
        assert!(stored.is_locked(), "{name}");

        let all = repos.analysts.list(&Default::default()).await.unwrap();
        let expired: Vec<_> = all
            .iter()
            .filter(|a| a.is_heartbeat_expired(Utc::now(), 60))
            .collect();
        assert_eq!(expired.len(), 1, "{name}");
        assert_eq!(expired[0].endpoint, stale.endpoint, "{name}");
    }
}

#[tokio::test]
async fn test_job_creation_is_all_or_nothing() {
    for (name, repos) in backends().await {
        let job = JobSpecBuilder::new().build_job();
        let ok = TaskSpecBuilder::new("ok").build_for(&job);
        let mut looped = TaskSpecBuilder::new("loop").build_for(&job);
        looped.depends_on = vec![looped.id];

        let err = repos.jobs.create(&job, &[ok, looped]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)), "{name}: {err}");
        assert!(repos.jobs.get(job.id).await.unwrap().is_none(), "{name}");
        assert!(repos
            .tasks
            .list(&TaskFilter::default())
            .await
            .unwrap()
            .is_empty());

        let orphaned = JobSpecBuilder::new()
            .depends_on_job(Uuid::new_v4())
            .build_job();
        let task = TaskSpecBuilder::new("a").build_for(&orphaned);
        let err = repos.jobs.create(&orphaned, &[task]).await.unwrap_err();
        assert!(err.is_not_found(), "{name}");
        assert!(repos.jobs.get(orphaned.id).await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_job_dependencies_hold_dispatch() {
    for (name, repos) in backends().await {
        let upstream = create_job(&repos, 0).await;

        let downstream = JobSpecBuilder::new()
            .with_priority(5)
            .depends_on_job(upstream.id)
            .build_job();
        let task = TaskSpecBuilder::new("after").build_for(&downstream);
        let downstream = repos
            .jobs
            .create(&downstream, &[task.clone()])
            .await
            .unwrap();
        assert_eq!(downstream.job_depend_count, 1, "{name}");
        assert_eq!(downstream.depend_on_job_ids, vec![upstream.id], "{name}");
        assert_eq!(downstream.task_counts.waiting, 1, "{name}");

        assert!(repos.tasks.dispatch_candidates(10).await.unwrap().is_empty(), "{name}");
        assert!(repos
            .tasks
            .claim(task.id, "h:1", Utc::now())
            .await
            .unwrap()
            .is_none());

        repos
            .jobs
            .set_state(upstream.id, JobState::Success, Some(JobState::InProgress))
            .await
            .unwrap();
        let released = repos.jobs.resolve_job_dependents(upstream.id).await.unwrap();
        assert_eq!(released, vec![downstream.id], "{name}");
        assert!(repos
            .jobs
            .resolve_job_dependents(upstream.id)
            .await
            .unwrap()
            .is_empty());

        let candidates = repos.tasks.dispatch_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1, "{name}");
        assert_eq!(candidates[0].id, task.id, "{name}");

        // 依赖已经结束的作业，创建时直接解除
        let late = JobSpecBuilder::new().depends_on_job(upstream.id).build_job();
        let late = repos.jobs.create(&late, &[]).await.unwrap();
        assert_eq!(late.job_depend_count, 0, "{name}");
        assert!(late.is_dispatchable(), "{name}");
    }
}

#[tokio::test]
async fn test_analyst_mark_down_is_conditional() {
    for (name, repos) in backends().await {
        let stale = AnalystBuilder::new("stale")
            .with_last_ping(TestEnv::timestamp_with_offset(-3600))
            .build();
        let fresh = AnalystBuilder::new("fresh").build();
        repos.analysts.upsert(&stale).await.unwrap();
        repos.analysts.upsert(&fresh).await.unwrap();

        let cutoff = TestEnv::timestamp_with_offset(-60);
        assert!(repos
            .analysts
            .mark_down_if_silent(&stale.endpoint, cutoff)
            .await
            .unwrap());
        assert!(!repos
            .analysts
            .mark_down_if_silent(&fresh.endpoint, cutoff)
            .await
            .unwrap());

        // Down之后重新上报心跳，旧的截止时间不能再删除它
        repos
            .analysts
            .upsert(&AnalystBuilder::new("stale").build())
            .await
            .unwrap();
        assert!(!repos
            .analysts
            .delete_if_silent(&stale.endpoint, cutoff)
            .await
            .unwrap());
        let revived = repos.analysts.get(&stale.endpoint).await.unwrap().unwrap();
        assert!(revived.is_up(), "{name}");
    }
}
