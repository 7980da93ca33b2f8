//! Property tests: batch boundaries never change the projected result.

mod common;

use std::sync::Arc;

use common::{added, instance, notes_worker, renamed, titles, NotesProjection};
use eventview::{HandlerConfig, Position};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The last rename wins whatever the bulk limit.
    #[test]
    fn last_rename_wins_for_any_bulk_limit(
        titles_in_order in prop::collection::vec("[a-z]{1,12}", 1..40),
        bulk_limit in 1u64..10,
    ) {
        tokio_test::block_on(async {
            let config = HandlerConfig {
                bulk_limit,
                ..HandlerConfig::default()
            };
            let (worker, backend, source) =
                notes_worker(Arc::new(NotesProjection::new()), config).await;
            source.append(added("i1", "n1", "initial"));
            source.append_all(titles_in_order.iter().map(|title| renamed("i1", "n1", title)));

            loop {
                let report = worker.run_once().await.unwrap();
                if !report.backlog {
                    break;
                }
            }

            let expected = titles_in_order.last().unwrap().clone();
            prop_assert_eq!(titles(&backend), vec![expected]);
            let state = worker.state(&instance("i1")).await.unwrap().unwrap();
            let total = u64::try_from(titles_in_order.len()).unwrap() + 1;
            prop_assert_eq!(state.position, Position::new(total));
            Ok(())
        })?;
    }

    /// Interleaved instances only ever see their own events.
    #[test]
    fn instances_progress_independently(
        owners in prop::collection::vec(0usize..3, 1..30),
        bulk_limit in 1u64..5,
    ) {
        tokio_test::block_on(async {
            let config = HandlerConfig {
                bulk_limit,
                max_iterators: 100,
                ..HandlerConfig::default()
            };
            let (worker, backend, source) =
                notes_worker(Arc::new(NotesProjection::new()), config).await;
            for (index, owner) in owners.iter().enumerate() {
                source.append(added(
                    &format!("i{owner}"),
                    &format!("n{index}"),
                    &format!("i{owner}"),
                ));
            }

            worker.run_once().await.unwrap();

            let rows = backend.rows(common::NOTES);
            prop_assert_eq!(rows.len(), owners.len());
            for row in rows {
                prop_assert_eq!(row.get("instance_id"), row.get("title"));
            }
            Ok(())
        })?;
    }
}
