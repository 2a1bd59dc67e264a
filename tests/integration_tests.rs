//! End-to-end tests: a real manager and real nodes talking HTTP on loopback.

mod test_harness;

use std::time::Duration;

use foreman::scheduler::job::JobSpec;
use foreman::scheduler::CancelOutcome;
use test_harness::{assert_eventually, RunningManager, RunningNode};
use uuid::Uuid;

const DEAD_THRESHOLD: Duration = Duration::from_millis(400);

async fn wait_for_nodes(manager: &RunningManager, count: usize) {
    let client = manager.client.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move {
                client
                    .nodes()
                    .await
                    .map(|nodes| nodes.iter().filter(|n| n.alive).count() == count)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "nodes did not register with the manager",
    )
    .await;
}

async fn wait_for_result(manager: &RunningManager, job_id: Uuid) -> String {
    let client = manager.client.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move {
                matches!(client.history(job_id).await, Ok(Some(h)) if h.result.is_some())
            }
        },
        Duration::from_secs(10),
        "job never finished",
    )
    .await;
    manager
        .client
        .history(job_id)
        .await
        .unwrap()
        .unwrap()
        .result
        .unwrap()
}

async fn wait_until_started(manager: &RunningManager, job_id: Uuid) -> String {
    let client = manager.client.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move {
                matches!(client.history(job_id).await, Ok(Some(h)) if h.sent_to.is_some())
            }
        },
        Duration::from_secs(5),
        "job was never dispatched",
    )
    .await;
    manager
        .client
        .history(job_id)
        .await
        .unwrap()
        .unwrap()
        .sent_to
        .unwrap()
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let node = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 1).await;
    assert!(manager.client.ping().await);

    let job_id = manager
        .client
        .submit(&JobSpec::new("greeting", "hello world", "echo", "alice"))
        .await
        .unwrap()
        .job_id;

    assert_eq!(wait_for_result(&manager, job_id).await, "Success");
    let history = manager.client.history(job_id).await.unwrap().unwrap();
    assert_eq!(history.sent_to.as_deref(), Some(node.url.as_str()));

    let details: Vec<String> = manager
        .client
        .details(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.text)
        .collect();
    assert_eq!(details, vec!["Added", "Started", "Success", "hello world"]);

    node.kill().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_shell_job_output_is_recorded() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let node = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 1).await;

    let job_id = manager
        .client
        .submit(&JobSpec::new("shell", "echo from-shell", "shell", "alice"))
        .await
        .unwrap()
        .job_id;

    assert_eq!(wait_for_result(&manager, job_id).await, "Success");
    let details = manager.client.details(job_id).await.unwrap();
    assert!(details.iter().any(|d| d.text == "from-shell"));

    node.kill().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_job_keeps_error() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let node = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 1).await;

    let job_id = manager
        .client
        .submit(&JobSpec::new("doomed", "no such table", "fail", "alice"))
        .await
        .unwrap()
        .job_id;

    assert_eq!(wait_for_result(&manager, job_id).await, "Failed");
    let details = manager.client.details(job_id).await.unwrap();
    assert!(details.iter().any(|d| d.text == "no such table"));

    node.kill().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_payload_type_is_removed() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let node = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 1).await;

    let job_id = manager
        .client
        .submit(&JobSpec::new("odd", "x", "teleport", "alice"))
        .await
        .unwrap()
        .job_id;

    let result = wait_for_result(&manager, job_id).await;
    assert!(
        result.starts_with("Removed because of bad request"),
        "{}",
        result
    );
    assert!(result.contains("teleport"));
    assert!(manager.manager.jobs().await.is_empty());

    node.kill().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let node = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 1).await;

    let job_id = manager
        .client
        .submit(&JobSpec::new("long", "60000", "sleep", "alice"))
        .await
        .unwrap()
        .job_id;
    wait_until_started(&manager, job_id).await;

    let response = manager.client.cancel(job_id).await.unwrap();
    assert!(matches!(
        response.outcome,
        CancelOutcome::Canceling | CancelOutcome::Canceled
    ));

    assert_eq!(wait_for_result(&manager, job_id).await, "Canceled");
    let agent = node.agent.clone();
    assert_eventually(
        || {
            let agent = agent.clone();
            async move { agent.is_idle().await }
        },
        Duration::from_secs(2),
        "node slot was not freed",
    )
    .await;

    node.kill().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_jobs_spread_across_nodes() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let a = RunningNode::start(&manager.url).await;
    let b = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 2).await;

    let mut jobs = Vec::new();
    for i in 0..2 {
        let spec = JobSpec::new(format!("long-{}", i), "60000", "sleep", "alice");
        jobs.push(manager.client.submit(&spec).await.unwrap().job_id);
    }

    let first = wait_until_started(&manager, jobs[0]).await;
    let second = wait_until_started(&manager, jobs[1]).await;
    assert_ne!(first, second);

    // A third job waits until a node frees up.
    let third = manager
        .client
        .submit(&JobSpec::new("quick", "hi", "echo", "alice"))
        .await
        .unwrap()
        .job_id;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(manager.client.history(third).await.unwrap().unwrap().sent_to.is_none());

    manager.client.cancel(jobs[0]).await.unwrap();
    assert_eq!(wait_for_result(&manager, third).await, "Success");

    a.kill().await;
    b.kill().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_job_moves_to_surviving_node_when_its_node_dies() {
    let manager = RunningManager::start(DEAD_THRESHOLD).await;
    let a = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 1).await;

    let job_id = manager
        .client
        .submit(&JobSpec::new("survivor", "2000", "sleep", "alice"))
        .await
        .unwrap()
        .job_id;
    assert_eq!(wait_until_started(&manager, job_id).await, a.url);

    let b = RunningNode::start(&manager.url).await;
    wait_for_nodes(&manager, 2).await;
    let dead_url = a.url.clone();
    a.kill().await;

    assert_eq!(wait_for_result(&manager, job_id).await, "Success");
    let history = manager.client.history(job_id).await.unwrap().unwrap();
    assert_eq!(history.sent_to.as_deref(), Some(b.url.as_str()));

    let nodes = manager.client.nodes().await.unwrap();
    let dead = nodes.iter().find(|n| n.url == dead_url).unwrap();
    assert!(!dead.alive);

    let details = manager.client.details(job_id).await.unwrap();
    assert!(details.iter().any(|d| d.text.starts_with("Requeued")));

    b.kill().await;
    manager.shutdown().await;
}
