use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::events::OutputEvent;

const MIN_CAPACITY: usize = 8;

pub(crate) enum PopOutcome {
    Event(OutputEvent),
    Empty,
    /// The terminal exit event has been delivered and nothing remains.
    Drained,
}

/// Single-producer/single-consumer bounded event buffer. The producer pushes
/// synchronously; the consumer registers on `notified` before polling so no
/// wakeup is lost. Once an exit event is queued the buffer is closed and
/// later pushes are discarded.
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<OutputEvent>,
    closed: bool,
    degraded: bool,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(MIN_CAPACITY),
        }
    }

    pub(crate) fn push(&self, event: OutputEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed {
            return;
        }
        let closing = event.is_exit();
        state.events.push_back(event);
        if closing {
            state.closed = true;
        } else if state.events.len() > self.capacity {
            state.compact();
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn try_pop(&self) -> PopOutcome {
        let Ok(mut state) = self.state.lock() else {
            return PopOutcome::Drained;
        };
        match state.events.pop_front() {
            Some(event) => PopOutcome::Event(event),
            None if state.closed => PopOutcome::Drained,
            None => PopOutcome::Empty,
        }
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub(crate) fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.state.lock().map(|state| state.degraded).unwrap_or(false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().map(|state| state.events.len()).unwrap_or(0)
    }
}

impl QueueState {
    /// Reclaims one slot without losing the terminal event: merge the two
    /// oldest same-origin fragments, else drop a snapshot that a newer
    /// snapshot supersedes, else drop the oldest event outright.
    fn compact(&mut self) {
        self.degraded = true;

        for index in 0..self.events.len().saturating_sub(1) {
            let mergeable = matches!(
                (&self.events[index], &self.events[index + 1]),
                (
                    OutputEvent::Fragment { origin: a, .. },
                    OutputEvent::Fragment { origin: b, .. },
                ) if a == b
            );
            if mergeable {
                if let Some(OutputEvent::Fragment { content: tail, .. }) =
                    self.events.remove(index + 1)
                    && let Some(OutputEvent::Fragment { content, .. }) =
                        self.events.get_mut(index)
                {
                    content.push_str(&tail);
                }
                return;
            }
        }

        let snapshots: Vec<usize> = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, event)| matches!(event, OutputEvent::FullSnapshot { .. }))
            .map(|(index, _)| index)
            .collect();
        if snapshots.len() >= 2 {
            self.events.remove(snapshots[0]);
            return;
        }

        self.events.pop_front();
    }
}
