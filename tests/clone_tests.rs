// Clone executor tests against the simulated hypervisor. Time is paused so
// backoff delays can be asserted exactly.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use fleet_vm_manager::core::{CloneExecutor, ClonePolicy, CloneRequest};
use fleet_vm_manager::errors::RetryPolicy;
use fleet_vm_manager::hypervisor::{SimulatedHypervisor, StorageInfo, VmRef};

fn demo() -> Arc<SimulatedHypervisor> {
    let sim = SimulatedHypervisor::demo();
    sim.set_task_polls(0);
    Arc::new(sim)
}

#[tokio::test(start_paused = true)]
async fn test_lock_contention_is_retried_with_backoff() -> Result<()> {
    let sim = demo();
    sim.lock_next_clones(2);
    let executor = CloneExecutor::new(sim.clone(), ClonePolicy::default());

    let start = Instant::now();
    let request = CloneRequest::linked(VmRef::new(9000, "pve1"), 100, "class-1-student-1");
    let outcome = executor.clone_vm(&request).await;

    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.attempts, 3);
    // 4s after the first failure, 8s after the second.
    assert_eq!(start.elapsed(), Duration::from_secs(12));
    assert!(sim.exists(100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_other_errors_fail_on_first_attempt() -> Result<()> {
    let sim = demo();
    sim.fail_clone_named("class-1-student-1", "storage 'local-lvm' is full");
    let executor = CloneExecutor::new(sim.clone(), ClonePolicy::default());

    let start = Instant::now();
    let request = CloneRequest::linked(VmRef::new(9000, "pve1"), 100, "class-1-student-1");
    let outcome = executor.clone_vm(&request).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.message.contains("is full"));
    assert_eq!(outcome.vmid, None);
    assert_eq!(start.elapsed(), Duration::ZERO);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lock_retries_give_up_at_the_ceiling() -> Result<()> {
    let sim = demo();
    sim.lock_next_clones(10);
    let policy = ClonePolicy {
        retry: RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        },
        ..ClonePolicy::default()
    };
    let executor = CloneExecutor::new(sim.clone(), policy);

    let start = Instant::now();
    let outcome = executor
        .clone_vm(&CloneRequest::linked(VmRef::new(9000, "pve1"), 100, "s1"))
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 3);
    // Two backoffs, none after the last attempt.
    assert_eq!(start.elapsed(), Duration::from_secs(12));
    assert!(outcome.message.contains("got timeout"));
    assert!(!sim.exists(100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_linked_clone_on_raw_nfs_becomes_full() -> Result<()> {
    let sim = demo();
    sim.add_storage(StorageInfo {
        storage: "nfs-share".to_string(),
        kind: "nfs".to_string(),
        shared: true,
    });
    sim.add_vm(9100, "pve1", "raw-template", "nfs-share:9100/base-9100-disk-0.raw,size=20G");
    let executor = CloneExecutor::new(sim.clone(), ClonePolicy::default());

    let outcome = executor
        .clone_vm(&CloneRequest::linked(VmRef::new(9100, "pve1"), 120, "raw-copy"))
        .await;

    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.message, "Full clone created");
    let submitted = sim.clone_log();
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].full);
    assert_eq!(sim.linked_base_of(120), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_baseline_snapshot_after_unlock() -> Result<()> {
    let sim = demo();
    sim.set_lock_polls(2);
    let executor = CloneExecutor::new(sim.clone(), ClonePolicy::default());

    let request = CloneRequest::full(VmRef::new(9000, "pve1"), 150, "pve2", "class-1-teacher")
        .with_baseline(Some("baseline".to_string()));
    let outcome = executor.clone_vm(&request).await;

    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(outcome.node, "pve2");
    assert_eq!(sim.snapshots_of(150), vec!["baseline".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_missing_vm_is_ok() -> Result<()> {
    let sim = demo();
    let executor = CloneExecutor::new(sim, ClonePolicy::default());
    executor.delete_vm(&VmRef::new(4242, "pve1")).await?;
    Ok(())
}
