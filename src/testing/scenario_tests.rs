//! End-to-end scenarios over in-memory backing nodes.
//!
//! These tests verify the behaviors the cache promises under failure:
//! - Quorum reads survive a lost replica, and anti-entropy re-seeds it
//! - Eventual writes converge once the background loop has run
//! - Node failures surface as notifications and trigger repair

#[cfg(test)]
mod tests {
    use crate::replication::ConsistencyLevel;
    use crate::sync::SyncNotification;
    use crate::testing::{json, synchronize_now, wait_for, TestCluster};
    use std::time::Duration;

    #[test_log::test(tokio::test)]
    async fn test_quorum_read_survives_node_loss_and_resync() {
        let cluster = TestCluster::new(3);
        let cache = cluster
            .start(cluster.config("app-1", 3, ConsistencyLevel::Quorum))
            .await
            .unwrap();

        cache.set("a", &1, None).await.unwrap();
        let victim = cache.replicas("a").await.unwrap()[0].clone();

        cluster.kill(&victim);
        assert_eq!(cache.get::<i32>("a").await.unwrap(), Some(1));

        // Comes back empty, sync events included.
        cluster.restart(&victim);

        synchronize_now(&cache).await.unwrap();
        assert_eq!(cluster.peek(&victim, "a").await, json(&1));

        for (_, value) in cluster.replica_values("a").await {
            assert_eq!(value, json(&1));
        }
        cache.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_eventual_write_converges_after_sync_interval() {
        let cluster = TestCluster::new(3);
        let config = cluster
            .config("app-1", 3, ConsistencyLevel::Eventual)
            .with_sync_interval(Duration::from_millis(100));
        let cache = cluster.start(config).await.unwrap();

        let replicas = cache.replicas("b").await.unwrap();
        let lagging = replicas[2].clone();

        // The secondary write to this replica is lost.
        cluster.kill(&lagging);
        cache.set("b", &2, None).await.unwrap();

        // A secondary may or may not have it yet.
        let early = cluster.peek(&replicas[1], "b").await;
        assert!(early.is_none() || early == json(&2));

        cache.flush().await;
        assert_eq!(cluster.peek(&lagging, "b").await, None);
        cluster.revive(&lagging);

        let cluster = &cluster;
        let converged = wait_for(
            move || async move {
                cluster
                    .replica_values("b")
                    .await
                    .values()
                    .all(|v| *v == json(&2))
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(converged, "replicas did not converge: {:?}", cluster.replica_values("b").await);
        assert!(cache.health_status().sync.last_sync.is_some());
        assert!(cache.metrics().secondary_failures >= 1);

        cache.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_node_failure_notifies_and_repairs() {
        let cluster = TestCluster::new(3);
        let cache = cluster
            .start(cluster.config("app-1", 3, ConsistencyLevel::Quorum))
            .await
            .unwrap();
        let mut notifications = cache.subscribe();

        cache.set("k", "v", None).await.unwrap();
        cluster.restart("node-2");
        cluster.kill("node-2");

        let failure = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match notifications.recv().await {
                    Ok(SyncNotification::NodeFailure { node_id, .. }) => return node_id,
                    Ok(_) => continue,
                    Err(e) => panic!("notification channel failed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failure, "node-2");

        cluster.revive("node-2");
        let recovered = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SyncNotification::NodeRecovered { node_id }) = notifications.recv().await {
                    return node_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(recovered, "node-2");

        // The recovery triggers a pass that re-seeds the empty node.
        let cluster = &cluster;
        let reseeded = wait_for(
            move || async move { cluster.peek("node-2", "k").await == json(&"v") },
            Duration::from_secs(5),
        )
        .await;
        assert!(reseeded);

        let health = cache.health_status();
        assert!(health.all_healthy());
        cache.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_two_processes_share_backing_nodes() {
        let cluster = TestCluster::new(3);
        let a = cluster
            .start(cluster.config("app-a", 2, ConsistencyLevel::Quorum))
            .await
            .unwrap();
        let b = cluster
            .start(cluster.config("app-b", 2, ConsistencyLevel::Quorum))
            .await
            .unwrap();

        a.set("shared", &"from-a", None).await.unwrap();
        assert_eq!(b.get::<String>("shared").await.unwrap().as_deref(), Some("from-a"));

        b.del("shared").await.unwrap();
        assert_eq!(a.get::<String>("shared").await.unwrap(), None);

        // b sees a's events and a sees b's.
        a.flush().await;
        b.flush().await;
        let report = synchronize_now(&a).await.unwrap();
        assert_eq!(report.events_collected, 2);
        assert_eq!(report.conflicts, 1);
        assert_eq!(a.get::<String>("shared").await.unwrap(), None);

        a.shutdown().await;
        b.shutdown().await;
    }
}
