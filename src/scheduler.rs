use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::shard::Shard;

/// Run [`Shard::periodic_commit_check`] on every shard once per `period`
/// until the returned handle is aborted.
///
/// Checks run on the blocking pool since a commit does disk I/O. A failed
/// check is logged and retried on the next tick.
pub fn spawn_commit_checker(
    shards: Vec<Arc<Shard>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            for shard in &shards {
                let task_shard = shard.clone();
                let checked = tokio::task::spawn_blocking(move || {
                    task_shard.periodic_commit_check()
                })
                .await;
                match checked {
                    Ok(Ok(true)) => debug!(
                        shard = shard.shard_number(),
                        index = shard.index_name(),
                        "Idle commit"
                    ),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => warn!(
                        shard = shard.shard_number(),
                        index = shard.index_name(),
                        "Periodic commit failed: {}",
                        e
                    ),
                    Err(e) => warn!("Periodic commit task failed: {}", e),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{FieldConfig, FieldType, IndexConfig, IndexSettings};

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_shards_get_committed() {
        let config = IndexConfig::new(IndexSettings {
            index_name: "books".to_string(),
            idle_time_without_commit: 0,
            fields: vec![
                FieldConfig::new("title", FieldType::Text).index_as("title"),
            ],
            ..IndexSettings::default()
        })
        .unwrap();
        let shard = Arc::new(Shard::open_in_ram(config, 0, true).unwrap());
        let serde_json::Value::Object(doc) = json!({ "title": "dune" }) else {
            unreachable!()
        };
        shard.index("a", 0, &doc, &[]).unwrap();

        let period = Duration::from_millis(10);
        let handle = spawn_commit_checker(vec![shard.clone()], period);
        let mut committed = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if shard.last_commit_millis().is_some() {
                committed = true;
                break;
            }
        }
        handle.abort();

        assert!(committed);
        assert_eq!(shard.document_count().unwrap().number_of_docs, 1);
    }
}
