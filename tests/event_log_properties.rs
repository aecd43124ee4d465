mod common;

use common::strategies::emission_strategy;
use progress_relay::events::{EventLog, EventType, NewEvent};
use progress_relay::EventId;
use proptest::prelude::*;
use serde_json::json;

fn new_event(task_id: &str, progress: u8) -> NewEvent {
    NewEvent::new(
        EventType::Progress,
        task_id,
        json!({"progress": progress, "status": "processing"}),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: per-task queries return exactly that task's events, in call order
    #[test]
    fn events_by_task_preserve_call_order(emissions in emission_strategy(40)) {
        let (stored, by_task) = tokio_test::block_on(async {
            let log = EventLog::in_memory(1000).await.unwrap();
            let mut stored = Vec::new();
            for (task_id, progress) in &emissions {
                stored.push(log.store_event(new_event(task_id, *progress)).await.unwrap());
            }
            let mut by_task = Vec::new();
            for task_id in ["task-a", "task-b", "task-c"] {
                by_task.push((task_id, log.get_events_by_task_id(task_id).await.unwrap()));
            }
            (stored, by_task)
        });

        for (task_id, events) in by_task {
            let expected: Vec<_> = stored.iter().filter(|e| e.task_id == task_id).cloned().collect();
            prop_assert_eq!(events, expected);
        }
    }

    /// Property: events since a retained cursor are exactly the later ones, in order
    #[test]
    fn events_since_cursor_are_the_suffix(
        emissions in emission_strategy(40),
        pick in any::<prop::sample::Index>(),
    ) {
        let (stored, since, all) = tokio_test::block_on(async {
            let log = EventLog::in_memory(1000).await.unwrap();
            let mut stored = Vec::new();
            for (task_id, progress) in &emissions {
                stored.push(log.store_event(new_event(task_id, *progress)).await.unwrap());
            }
            let cursor = stored[pick.index(stored.len())].id;
            let since = log.get_events_since(Some(cursor)).await.unwrap();
            let all = log.get_events_since(EventId::parse_cursor("")).await.unwrap();
            (stored, since, all)
        });

        let position = pick.index(stored.len());
        prop_assert_eq!(since, stored[position + 1..].to_vec());
        prop_assert_eq!(all, stored);
    }

    /// Property: the log never holds more than its cap and keeps the newest events
    #[test]
    fn cap_keeps_newest_events(cap in 1usize..20, extra in 0usize..20) {
        let total = cap + extra;
        let (count, retained) = tokio_test::block_on(async {
            let log = EventLog::in_memory(cap).await.unwrap();
            for i in 0..total {
                log.store_event(new_event("task-a", (i % 100) as u8)).await.unwrap();
            }
            (log.count().await.unwrap(), log.get_events_since(None).await.unwrap())
        });

        prop_assert_eq!(count, cap);
        let ids: Vec<i64> = retained.iter().map(|e| e.id.sequence()).collect();
        let expected: Vec<i64> = ((extra as i64 + 1)..=(total as i64)).collect();
        prop_assert_eq!(ids, expected);
    }
}

#[tokio::test]
async fn test_thousand_and_one_events_drop_the_first() {
    let log = EventLog::in_memory(1000).await.unwrap();
    let first = log.store_event(new_event("task-a", 0)).await.unwrap();
    for i in 1..1001 {
        log.store_event(new_event(if i % 2 == 0 { "task-a" } else { "task-b" }, 1))
            .await
            .unwrap();
    }

    assert_eq!(log.count().await.unwrap(), 1000);
    let retained = log.get_events_since(EventId::parse_cursor("")).await.unwrap();
    assert_eq!(retained.len(), 1000);
    assert!(retained.iter().all(|e| e.id != first.id));
    assert!(!log.contains(first.id).await.unwrap());
}
