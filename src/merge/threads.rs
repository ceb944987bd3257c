use std::collections::BTreeMap;

use crate::models::{ThreadActivity, ThreadState, ThreadStateEvent};

/// Build per-thread activity for the window starting at `start`.
///
/// `prior` holds, per thread, the last transition strictly before `start`;
/// `in_window` holds the transitions inside the window. A thread that was
/// already in some state when the window opened gets a synthesized transition
/// stamped at `start` carrying that state, unless it was already dead, in
/// which case it only shows up if it has transitions of its own in the window.
pub fn synthesize_thread_activity(
    prior: Vec<ThreadStateEvent>,
    in_window: Vec<ThreadStateEvent>,
    start: i64,
) -> Vec<ThreadActivity> {
    let mut by_thread: BTreeMap<i64, (Option<ThreadStateEvent>, Vec<ThreadStateEvent>)> =
        BTreeMap::new();

    for event in prior {
        let thread_id = event.thread_id;
        by_thread.entry(thread_id).or_default().0 = Some(event);
    }
    for event in in_window {
        by_thread.entry(event.thread_id).or_default().1.push(event);
    }

    by_thread
        .into_iter()
        .filter_map(|(thread_id, (last_before, mut events))| {
            events.sort_by_key(|event| event.timestamp);

            let starts_at_boundary = events.first().is_some_and(|event| event.timestamp == start);
            if let Some(last) = last_before {
                if !starts_at_boundary && last.state != ThreadState::Dead {
                    events.insert(
                        0,
                        ThreadStateEvent {
                            timestamp: start,
                            ..last
                        },
                    );
                }
            }

            let name = events.last()?.name.clone();
            Some(ThreadActivity {
                thread_id,
                name,
                events,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: i64 = 1_000_000_000;

    fn event(thread_id: i64, timestamp: i64, state: ThreadState) -> ThreadStateEvent {
        ThreadStateEvent {
            pid: 1,
            thread_id,
            name: format!("thread-{thread_id}"),
            timestamp,
            state,
        }
    }

    #[test]
    fn live_thread_is_synthesized_at_window_start_and_dead_one_dropped() {
        // Thread 1 died at 10s, thread 2 has been running since 5s.
        let prior = vec![
            event(1, 10 * SECOND, ThreadState::Dead),
            event(2, 5 * SECOND, ThreadState::Running),
        ];

        let activity = synthesize_thread_activity(prior, Vec::new(), 20 * SECOND);

        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].thread_id, 2);
        assert_eq!(activity[0].events.len(), 1);
        assert_eq!(activity[0].events[0].timestamp, 20 * SECOND);
        assert_eq!(activity[0].events[0].state, ThreadState::Running);
    }

    #[test]
    fn transition_at_the_boundary_is_not_duplicated() {
        let prior = vec![event(1, 2 * SECOND, ThreadState::Sleeping)];
        let in_window = vec![event(1, 20 * SECOND, ThreadState::Running)];

        let activity = synthesize_thread_activity(prior, in_window, 20 * SECOND);

        assert_eq!(activity[0].events.len(), 1);
        assert_eq!(activity[0].events[0].state, ThreadState::Running);
    }

    #[test]
    fn synthesized_state_precedes_in_window_transitions() {
        let prior = vec![event(4, SECOND, ThreadState::Waiting)];
        let in_window = vec![
            event(4, 30 * SECOND, ThreadState::Dead),
            event(4, 25 * SECOND, ThreadState::Running),
        ];

        let activity = synthesize_thread_activity(prior, in_window, 20 * SECOND);
        let states: Vec<(i64, ThreadState)> = activity[0]
            .events
            .iter()
            .map(|event| (event.timestamp, event.state))
            .collect();

        assert_eq!(
            states,
            vec![
                (20 * SECOND, ThreadState::Waiting),
                (25 * SECOND, ThreadState::Running),
                (30 * SECOND, ThreadState::Dead),
            ]
        );
        assert_eq!(activity[0].state_at(26 * SECOND), Some(ThreadState::Running));
    }

    #[test]
    fn threads_born_inside_the_window_need_no_synthesis() {
        let in_window = vec![event(9, 22 * SECOND, ThreadState::Running)];
        let activity = synthesize_thread_activity(Vec::new(), in_window, 20 * SECOND);
        assert_eq!(activity[0].events[0].timestamp, 22 * SECOND);
        assert_eq!(activity[0].state_at(21 * SECOND), None);
    }

    #[test]
    fn output_is_ordered_by_thread_id() {
        let in_window = vec![
            event(8, 21 * SECOND, ThreadState::Running),
            event(3, 21 * SECOND, ThreadState::Running),
        ];
        let ids: Vec<i64> = synthesize_thread_activity(Vec::new(), in_window, 20 * SECOND)
            .iter()
            .map(|activity| activity.thread_id)
            .collect();
        assert_eq!(ids, vec![3, 8]);
    }
}
