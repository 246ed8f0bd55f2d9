use super::*;
use crate::cluster::InMemoryCluster;
use crate::crd::test_support::{agreement, guaranteed_pod, record, NAMESPACE};
use crate::error::ScaleError;
use crate::health::components;
use crate::models::{RecordKey, ResourceVector, ResponseTimeSample};
use crate::quantity;
use async_trait::async_trait;
use tempfile::TempDir;

const MI: i64 = 1 << 20;

/// Always reports the agreement's target, so the law holds the estimate
struct OnTarget;

#[async_trait]
impl ResponseTimeSource for OnTarget {
    async fn response_time(&self, _address: &str) -> Result<ResponseTimeSample, ScaleError> {
        Ok(ResponseTimeSample {
            response_time_millis: 100.0,
        })
    }
}

fn test_config(audit_log_path: Option<PathBuf>) -> PipelineConfig {
    PipelineConfig {
        control_interval: Duration::from_millis(50),
        queue_capacity: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
        audit_log_path,
        ..Default::default()
    }
}

/// Two containers desiring 200m and 100m on a node with 200m allocatable
fn contended_cluster() -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_node("node-a", ResourceVector::new(200, 1 << 30));
    cluster.add_agreement(agreement(
        ResourceVector::new(10, MI),
        ResourceVector::new(2000, 1 << 30),
    ));
    for (name, cpu) in [("a", 200), ("b", 100)] {
        cluster.add_pod(guaranteed_pod(name, &format!("{}m", cpu), "1Mi"));
        cluster.add_record(record(name, "node-a", ResourceVector::new(cpu, MI)));
    }
    cluster
}

fn pod_cpu_limit(cluster: &InMemoryCluster, name: &str) -> Option<i64> {
    let pod = cluster.pod(NAMESPACE, name)?;
    let limits = pod.spec?.containers[0].resources.clone()?.limits?;
    quantity::read_resources(&limits).ok()?.0
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_contended_node_end_to_end() {
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.log");
    let cluster = contended_cluster();
    let pipeline = Pipeline::new(
        test_config(Some(audit_path.clone())),
        cluster.clone(),
        Arc::new(OnTarget),
    );
    let health = pipeline.health();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(pipeline.run(shutdown_rx, None));

    let applied = wait_for(|| {
        pod_cpu_limit(&cluster, "a") == Some(133) && pod_cpu_limit(&cluster, "b") == Some(66)
    })
    .await;
    assert!(applied, "capped values never reached the pods");
    assert!(health.readiness().await.ready);
    for stage in components::ALL {
        assert!(health.live_workers(stage) >= 1, "no workers for {stage}");
    }

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap();

    for (name, capped, desired) in [("a", 133, 200), ("b", 66, 100)] {
        let stored = cluster.record(&RecordKey::new(NAMESPACE, name)).unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.capped_resources.cpu_millicores, capped);
        assert_eq!(status.actual_resources.cpu_millicores, capped);
        assert!(status.bounded.cpu);
        assert_eq!(stored.spec.desired_resources.cpu_millicores, desired);
    }

    let audit = std::fs::read_to_string(&audit_path).unwrap();
    assert!(audit.lines().count() >= 2);
    assert!(!health.readiness().await.ready);
    for stage in components::ALL {
        assert_eq!(health.live_workers(stage), 0);
    }
}

#[tokio::test]
async fn test_deleted_record_state_is_evicted() {
    let cluster = contended_cluster();
    let events = cluster.subscribe().await;
    // Only the immediate first tick runs, so no cycle races the deletion
    let config = PipelineConfig {
        control_interval: Duration::from_secs(3600),
        ..test_config(None)
    };
    let pipeline = Pipeline::new(config, cluster.clone(), Arc::new(OnTarget));
    let states = pipeline.states();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(pipeline.run(shutdown_rx, Some(events)));

    assert!(wait_for(|| states.len() == 2).await);

    let key = RecordKey::new(NAMESPACE, "b");
    cluster.delete_record(&key).await.unwrap();
    assert!(wait_for(|| states.get(&key).is_none()).await);
    assert!(states.get(&RecordKey::new(NAMESPACE, "a")).is_some());

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_with_idle_pipeline() {
    let cluster = Arc::new(InMemoryCluster::new());
    let pipeline = Pipeline::new(test_config(None), cluster, Arc::new(OnTarget));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(pipeline.run(shutdown_rx, None));
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap();
}
