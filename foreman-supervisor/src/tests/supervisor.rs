use super::fakes::{Harness, UnwritableRepository};
use crate::process::WorkerSignal;
use crate::{ControlAction, SupervisorError, SupervisorState};
use chrono::Utc;
use foreman_core::command::Command;
use foreman_core::metrics::QueueLoad;
use foreman_core::options::{Balance, SupervisorOptions};
use foreman_core::queue::CommandQueue;
use foreman_core::repository::{SupervisorRecord, SupervisorRepository, SupervisorStatus};
use std::collections::BTreeMap;
use std::time::Duration;

fn email(balance: Balance, max: usize) -> SupervisorOptions {
    SupervisorOptions::new("email", ["high", "low"])
        .with_balance(balance)
        .with_max_processes(max)
}

fn pool_sizes(supervisor: &crate::Supervisor) -> Vec<(String, usize)> {
    supervisor
        .pools()
        .iter()
        .map(|pool| (pool.queue().to_string(), pool.processes().len()))
        .collect()
}

#[tokio::test]
async fn test_scale_splits_evenly_across_pools() {
    let harness = Harness::new();
    let mut supervisor = harness.build(email(Balance::Simple, 10)).await;
    assert_eq!(supervisor.pools().len(), 2);

    supervisor.scale(6).unwrap();

    assert!(supervisor.pools().iter().all(|pool| pool.target() == 3));
    supervisor.loop_once().await;
    assert_eq!(supervisor.prune_and_get_total_processes(), 6);
    assert_eq!(harness.launcher.alive(), 6);
}

#[tokio::test]
async fn test_scale_rounds_down_and_never_lowers_max() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 10)).await;
    assert_eq!(supervisor.prune_and_get_total_processes(), 10);

    supervisor.scale(7).unwrap();
    assert_eq!(supervisor.prune_and_get_total_processes(), 6);
    assert_eq!(supervisor.options().max_processes, 10);

    supervisor.scale(12).unwrap();
    assert_eq!(supervisor.prune_and_get_total_processes(), 12);
    assert_eq!(supervisor.options().max_processes, 12);
}

#[tokio::test]
async fn test_single_pool_consumes_queue_list() {
    let harness = Harness::new();
    let supervisor = harness.start(email(Balance::Off, 3)).await;

    assert_eq!(pool_sizes(&supervisor), vec![("high,low".to_string(), 3)]);
    assert_eq!(harness.launcher.alive_for("high,low"), 3);
}

#[tokio::test]
async fn test_balance_skips_unknown_queue() {
    let harness = Harness::new();
    let mut supervisor = harness.build(email(Balance::Simple, 10)).await;

    let targets = BTreeMap::from([("missing".to_string(), 3), ("high".to_string(), 2)]);
    supervisor.balance(&targets).unwrap();

    assert_eq!(
        pool_sizes(&supervisor),
        vec![("high".to_string(), 2), ("low".to_string(), 0)]
    );
}

#[tokio::test]
async fn test_pause_then_continue_keeps_processes() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;
    let before: Vec<u32> = supervisor.processes().iter().map(|p| p.pid()).collect();

    supervisor.pause().unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Paused);
    assert_eq!(harness.launcher.paused(), 4);

    supervisor.resume().unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Working);
    assert_eq!(harness.launcher.paused(), 0);

    let after: Vec<u32> = supervisor.processes().iter().map(|p| p.pid()).collect();
    assert_eq!(before, after);
    assert_eq!(harness.launcher.launched(), 4);
}

#[tokio::test]
async fn test_paused_supervisor_does_not_heal_pools() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;
    supervisor.pause().unwrap();

    harness.launcher.crash_one("low").unwrap();
    supervisor.loop_once().await;

    assert_eq!(harness.launcher.alive_for("low"), 1);
    let record = harness.repository.find("email").await.unwrap().unwrap();
    assert_eq!(record.status, SupervisorStatus::Paused);
}

#[tokio::test]
async fn test_crashed_worker_is_replaced_on_next_tick() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 6)).await;

    harness.launcher.crash_one("low").unwrap();
    assert_eq!(harness.launcher.alive_for("low"), 2);

    supervisor.loop_once().await;

    let low = &supervisor.pools()[1];
    assert_eq!(low.queue(), "low");
    assert_eq!(low.processes().len(), 3);
    assert!(low.terminating_processes().is_empty());
    assert_eq!(harness.launcher.alive_for("low"), 3);
}

#[tokio::test]
async fn test_tick_persists_record_and_notifies_observer() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 6)).await;

    assert_eq!(supervisor.loop_once().await, None);

    let record = harness.repository.find("email").await.unwrap().unwrap();
    assert_eq!(record.status, SupervisorStatus::Running);
    assert_eq!(record.pid, std::process::id());
    assert_eq!(
        record.processes,
        BTreeMap::from([("redis:high".to_string(), 3), ("redis:low".to_string(), 3)])
    );
    assert_eq!(harness.observer.states(), vec![SupervisorState::Working]);
}

#[tokio::test]
async fn test_build_flushes_stale_commands() {
    let harness = Harness::new();
    harness.commands.push(Command::scale("email", 4)).await.unwrap();

    let mut supervisor = harness.start(email(Balance::Off, 2)).await;
    supervisor.loop_once().await;

    assert_eq!(supervisor.prune_and_get_total_processes(), 2);
    assert_eq!(harness.commands.len("email").await, 0);
}

#[tokio::test]
async fn test_commands_apply_in_order() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Off, 2)).await;

    harness.commands.push(Command::scale("email", 4)).await.unwrap();
    harness
        .commands
        .push(Command::new("email", foreman_core::command::CommandKind::Pause))
        .await
        .unwrap();
    supervisor.loop_once().await;

    assert_eq!(supervisor.prune_and_get_total_processes(), 4);
    assert_eq!(supervisor.state(), SupervisorState::Paused);
    assert_eq!(harness.launcher.paused(), 4);
}

#[tokio::test]
async fn test_terminate_command_ends_loop_with_status() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;
    supervisor.loop_once().await;

    harness
        .commands
        .push(Command::terminate("email", 2))
        .await
        .unwrap();

    assert_eq!(supervisor.loop_once().await, Some(2));
    assert_eq!(supervisor.state(), SupervisorState::Exited);
    assert!(harness.repository.find("email").await.unwrap().is_none());
}

#[tokio::test]
async fn test_control_actions_apply_on_tick() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 2)).await;

    assert!(supervisor.control().send(ControlAction::Pause));
    supervisor.loop_once().await;
    assert_eq!(supervisor.state(), SupervisorState::Paused);

    assert!(supervisor.control().send(ControlAction::Continue));
    supervisor.loop_once().await;
    assert_eq!(supervisor.state(), SupervisorState::Working);
}

#[tokio::test]
async fn test_restart_replaces_workers() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;

    supervisor.apply_action(ControlAction::Restart).unwrap();

    assert_eq!(harness.launcher.launched(), 8);
    assert_eq!(supervisor.prune_and_get_total_processes(), 4);
}

#[tokio::test]
async fn test_terminate_forgets_record_and_drains() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;
    supervisor.loop_once().await;
    assert!(harness.repository.find("email").await.unwrap().is_some());
    let pids: Vec<u32> = supervisor.processes().iter().map(|p| p.pid()).collect();

    assert_eq!(supervisor.terminate(0).await.unwrap(), 0);

    assert!(harness.repository.find("email").await.unwrap().is_none());
    assert_eq!(supervisor.total_process_count(), 0);
    assert_eq!(supervisor.state(), SupervisorState::Exited);
    assert_eq!(harness.launcher.alive(), 0);
    for pid in pids {
        assert_eq!(harness.launcher.signals_for(pid), vec![WorkerSignal::Terminate]);
    }

    // A second call has nothing left to do
    assert_eq!(supervisor.terminate(0).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_waits_for_workers_to_exit() {
    let harness = Harness::new();
    harness.launcher.ignore_terminate(true);
    let mut supervisor = harness.start(email(Balance::Off, 4)).await;
    supervisor.loop_once().await;

    let handle = tokio::spawn(async move {
        let status = supervisor.terminate(3).await.unwrap();
        (status, supervisor)
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(harness.repository.find("email").await.unwrap().is_none());
    assert_eq!(harness.launcher.alive(), 4);
    assert!(!handle.is_finished());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!handle.is_finished());

    harness.launcher.exit_all();
    let (status, supervisor) = handle.await.unwrap();

    assert_eq!(status, 3);
    assert_eq!(supervisor.total_process_count(), 0);
    assert_eq!(supervisor.state(), SupervisorState::Exited);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_kills_workers_past_grace() {
    let harness = Harness::new();
    harness.launcher.ignore_terminate(true);
    let options = email(Balance::Simple, 4).with_timeout(Duration::from_secs(5));
    let mut supervisor = harness.start(options).await;
    let pids: Vec<u32> = supervisor.processes().iter().map(|p| p.pid()).collect();
    let started = tokio::time::Instant::now();

    assert_eq!(supervisor.terminate(0).await.unwrap(), 0);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(7));
    assert_eq!(harness.launcher.alive(), 0);
    for pid in pids {
        assert_eq!(
            harness.launcher.signals_for(pid),
            vec![WorkerSignal::Terminate, WorkerSignal::Kill]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_forced_shutdown_skips_grace() {
    let harness = Harness::new();
    harness.launcher.ignore_terminate(true);
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;
    let started = tokio::time::Instant::now();

    supervisor.control().force_shutdown();
    assert_eq!(supervisor.terminate(1).await.unwrap(), 1);

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(harness.launcher.alive(), 0);
    assert_eq!(supervisor.total_process_count(), 0);
}

#[tokio::test]
async fn test_duplicate_name_is_refused() {
    let harness = Harness::new();
    let options = email(Balance::Simple, 2);
    harness
        .repository
        .update(&SupervisorRecord {
            name: "email".to_string(),
            master: String::new(),
            pid: 4242,
            status: SupervisorStatus::Running,
            processes: BTreeMap::new(),
            options: options.clone(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let supervisor = harness.build(options).await;
    let result = supervisor.monitor().await;

    assert!(matches!(result, Err(SupervisorError::Duplicate(name)) if name == "email"));
    assert_eq!(harness.launcher.launched(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_returns_terminate_status() {
    let harness = Harness::new();
    let supervisor = harness.build(email(Balance::Simple, 2)).await;
    let control = supervisor.control();

    let handle = tokio::spawn(supervisor.monitor());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(harness.launcher.alive(), 2);
    assert!(harness.repository.find("email").await.unwrap().is_some());

    assert!(control.send(ControlAction::Terminate(4)));
    assert_eq!(handle.await.unwrap().unwrap(), 4);
    assert!(harness.repository.find("email").await.unwrap().is_none());
    assert_eq!(harness.launcher.alive(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auto_scale_respects_cooldown() {
    let harness = Harness::new();
    let options = email(Balance::Auto, 10).with_balance_cooldown(Duration::from_secs(3));
    let mut supervisor = harness.start(options).await;

    assert!(supervisor.auto_scale().await.unwrap());
    assert_eq!(harness.metrics.reads(), 2);

    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!supervisor.auto_scale().await.unwrap());
    }
    assert_eq!(harness.metrics.reads(), 2);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(supervisor.auto_scale().await.unwrap());
    assert_eq!(harness.metrics.reads(), 4);
}

#[tokio::test]
async fn test_auto_scale_is_off_for_simple_balance() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 4)).await;

    assert!(!supervisor.auto_scale().await.unwrap());
    assert_eq!(harness.metrics.reads(), 0);
}

#[tokio::test]
async fn test_auto_scale_shifts_workers_to_busy_queue() {
    let harness = Harness::new();
    harness
        .metrics
        .inner
        .set("high", QueueLoad::new(100, Duration::from_secs(1)))
        .await;
    let options = email(Balance::Auto, 10).with_min_processes(1);
    let mut supervisor = harness.start(options).await;
    assert_eq!(
        pool_sizes(&supervisor),
        vec![("high".to_string(), 1), ("low".to_string(), 1)]
    );

    supervisor.loop_once().await;

    assert_eq!(
        pool_sizes(&supervisor),
        vec![("high".to_string(), 2), ("low".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_tick_errors_are_reported_not_fatal() {
    let harness = Harness::new();
    let mut supervisor = harness.start(email(Balance::Simple, 2)).await;

    harness.launcher.fail_launches(true);
    harness.launcher.crash_one("high").unwrap();

    assert_eq!(supervisor.loop_once().await, None);
    assert_eq!(harness.errors.messages().len(), 1);
    assert!(harness.errors.messages()[0].contains("high"));
    assert_eq!(harness.observer.states(), vec![SupervisorState::Working]);

    harness.launcher.fail_launches(false);
    supervisor.loop_once().await;
    assert_eq!(harness.launcher.alive_for("high"), 1);
}

#[tokio::test]
async fn test_failed_persist_still_notifies_observer() {
    let harness = Harness::new();
    let mut supervisor = harness
        .builder(email(Balance::Simple, 2))
        .repository(std::sync::Arc::new(UnwritableRepository))
        .build()
        .await
        .unwrap();
    supervisor.start().unwrap();

    assert_eq!(supervisor.loop_once().await, None);

    assert_eq!(harness.errors.messages().len(), 1);
    assert!(harness.errors.messages()[0].contains("connection refused"));
    assert_eq!(harness.observer.states(), vec![SupervisorState::Working]);
}

#[tokio::test]
async fn test_repeated_queue_is_refused_at_build() {
    let harness = Harness::new();
    let options = SupervisorOptions::new("email", ["high", "high"])
        .with_balance(Balance::Simple)
        .with_max_processes(4);

    let result = harness.builder(options).build().await;

    assert!(result.is_err());
    assert_eq!(harness.launcher.launched(), 0);
}

#[tokio::test]
async fn test_system_process_count_matches_bookkeeping() {
    let harness = Harness::new();
    let supervisor = harness.start(email(Balance::Simple, 4)).await;

    assert_eq!(supervisor.total_system_process_count().unwrap(), 4);
}

#[cfg(unix)]
#[tokio::test]
async fn test_orphaned_supervisor_terminates() {
    let harness = Harness::new();
    let mut options = email(Balance::Simple, 2);
    // Any pid other than the real parent
    options.parent_id = Some(std::os::unix::process::parent_id().wrapping_add(1).max(2));
    let mut supervisor = harness.start(options).await;

    assert_eq!(supervisor.loop_once().await, Some(0));
    assert_eq!(supervisor.state(), SupervisorState::Exited);
}
