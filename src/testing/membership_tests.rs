//! Adding and removing backing nodes under load.
//!
//! These tests verify that membership changes move keys to their new
//! owners without losing any, and that weights shape the key share.

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::replication::ConsistencyLevel;
    use crate::testing::{json, TestCluster};

    fn data_keys(cluster: &TestCluster, ids: &[&str]) -> usize {
        ids.iter().map(|id| cluster.node(id).data_key_count()).sum()
    }

    #[test_log::test(tokio::test)]
    async fn test_add_node_moves_a_quarter_of_replicas() {
        let cluster = TestCluster::new(3);
        let cache = cluster
            .start(cluster.config("app-1", 3, ConsistencyLevel::Quorum))
            .await
            .unwrap();

        for i in 0..200 {
            cache.set(&format!("key-{}", i), &i, None).await.unwrap();
        }
        assert_eq!(data_keys(&cluster, &["node-1", "node-2", "node-3"]), 600);

        let report = cache.add_node(TestCluster::node_config(4)).await.unwrap();
        assert_eq!(report.keys_scanned, 200);
        assert_eq!(report.failures, 0);
        assert!(report.keys_moved > 0);

        // Each key now lives on three of four nodes.
        let new_share = cluster.node("node-4").data_key_count();
        assert!((100..=190).contains(&new_share), "node-4 holds {} keys", new_share);
        assert_eq!(data_keys(&cluster, &["node-1", "node-2", "node-3", "node-4"]), 600);

        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(cache.get::<i32>(&key).await.unwrap(), Some(i));
            let replicas = cache.replicas(&key).await.unwrap();
            for id in &replicas {
                assert_eq!(cluster.peek(id, &key).await, json(&i), "{} missing on {}", key, id);
            }
        }

        let stats = cache.stats().await;
        assert_eq!(stats.total_nodes, 4);
        assert_eq!(cache.metrics().keys_moved, report.keys_moved as u64);

        cache.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_weighted_node_takes_its_share() {
        let cluster = TestCluster::new(3);
        let cache = cluster
            .start(cluster.config("app-1", 1, ConsistencyLevel::Strong))
            .await
            .unwrap();

        for i in 0..1000 {
            cache.set(&format!("key-{}", i), &i, None).await.unwrap();
        }
        cache
            .add_node(TestCluster::node_config(4).with_weight(2.0))
            .await
            .unwrap();

        // Weight 2 out of a total of 5.
        let heavy = cluster.node("node-4").data_key_count();
        assert!((300..=500).contains(&heavy), "weighted node holds {} of 1000 keys", heavy);
        assert_eq!(data_keys(&cluster, &["node-1", "node-2", "node-3", "node-4"]), 1000);

        cache.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_remove_node_loses_nothing() {
        let cluster = TestCluster::new(4);
        let cache = cluster
            .start(cluster.config("app-1", 2, ConsistencyLevel::Quorum))
            .await
            .unwrap();

        for i in 0..200 {
            cache.set(&format!("key-{}", i), &i, None).await.unwrap();
        }

        let report = cache.remove_node("node-2").await.unwrap();
        assert_eq!(report.failures, 0);
        assert_eq!(cluster.node("node-2").data_key_count(), 0);
        assert_eq!(data_keys(&cluster, &["node-1", "node-3", "node-4"]), 400);

        for i in 0..200 {
            let key = format!("key-{}", i);
            assert!(!cache.replicas(&key).await.unwrap().contains(&"node-2".to_string()));
            assert_eq!(cache.get::<i32>(&key).await.unwrap(), Some(i));
        }

        let health = cache.health_status();
        assert!(!health.cluster.contains_key("node-2"));
        assert_eq!(cache.stats().await.total_nodes, 3);

        cache.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_membership_errors() {
        let cluster = TestCluster::new(1);
        let cache = cluster
            .start(cluster.config("app-1", 1, ConsistencyLevel::Quorum))
            .await
            .unwrap();

        assert!(matches!(
            cache.add_node(TestCluster::node_config(1)).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(cache.remove_node("node-1").await, Err(Error::Config(_))));
        assert!(matches!(cache.remove_node("node-9").await, Err(Error::NodeNotFound(_))));

        assert!(matches!(
            cache
                .add_node(TestCluster::node_config(2).with_weight(0.0))
                .await,
            Err(Error::Config(_))
        ));
        assert_eq!(cache.stats().await.total_nodes, 1);

        cache.shutdown().await;
    }
}
