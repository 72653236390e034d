//! Bounded FIFO queues for outgoing records.
//!
//! The producer side is the scheduler's single cooperative thread, which must
//! never wait on the serial consumer. A full queue therefore rejects the record
//! and raises a diagnostic instead of blocking.

use core::fmt;

use heapless::Deque;

use crate::telemetry::{Diagnostic, QueueKind, SerialSink, emit_diagnostic};

/// Hard capacity of the report record queue.
pub const REPORT_QUEUE_CAPACITY: usize = 3_000;
/// Hard capacity of the trial summary queue.
pub const TRIAL_QUEUE_CAPACITY: usize = 3_000;
/// Report backlog above which housekeeping raises a health diagnostic.
pub const REPORT_BACKLOG_THRESHOLD: usize = 1_000;
/// Trial summary backlog above which housekeeping raises a health diagnostic.
pub const TRIAL_BACKLOG_THRESHOLD: usize = 500;

/// Errors produced by [`BoundedQueue`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueError {
    /// The record was rejected because every slot is taken.
    Full,
    /// Nothing to dequeue.
    Empty,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => f.write_str("queue full"),
            QueueError::Empty => f.write_str("queue empty"),
        }
    }
}

/// Fixed-capacity FIFO that reports misuse through an optional sink.
pub struct BoundedQueue<T, const N: usize, S> {
    items: Deque<T, N>,
    kind: QueueKind,
    sink: Option<S>,
    overflows: u32,
}

impl<T, const N: usize, S> BoundedQueue<T, N, S>
where
    S: SerialSink,
{
    #[must_use]
    pub const fn new(kind: QueueKind) -> Self {
        Self {
            items: Deque::new(),
            kind,
            sink: None,
            overflows: 0,
        }
    }

    /// Binds the destination for overflow and underflow diagnostics.
    pub fn set_sink(&mut self, sink: S) {
        self.sink = Some(sink);
    }

    pub fn enqueue(&mut self, item: T) -> Result<(), QueueError> {
        if self.items.push_back(item).is_err() {
            self.overflows = self.overflows.saturating_add(1);
            self.diagnose(Diagnostic::QueueFull(self.kind));
            return Err(QueueError::Full);
        }
        Ok(())
    }

    pub fn dequeue(&mut self) -> Result<T, QueueError> {
        match self.items.pop_front() {
            Some(item) => Ok(item),
            None => {
                self.diagnose(Diagnostic::QueueEmpty(self.kind));
                Err(QueueError::Empty)
            }
        }
    }

    /// Returns the oldest record without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.is_full()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of records rejected since construction.
    #[must_use]
    pub const fn overflow_count(&self) -> u32 {
        self.overflows
    }

    #[must_use]
    pub const fn kind(&self) -> QueueKind {
        self.kind
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        if let Some(sink) = &self.sink {
            emit_diagnostic(sink, &diagnostic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{LineBuffer, SerialPort};
    use core::cell::RefCell;

    #[derive(Default)]
    struct LastLine {
        line: RefCell<Option<LineBuffer>>,
        lines: RefCell<usize>,
    }

    impl SerialSink for LastLine {
        fn write_line(&self, _: SerialPort, line: &str) {
            let mut owned = LineBuffer::new();
            owned.push_str(line).expect("line fits");
            *self.line.borrow_mut() = Some(owned);
            *self.lines.borrow_mut() += 1;
        }
    }

    #[test]
    fn dequeues_in_enqueue_order() {
        let mut queue: BoundedQueue<u32, 4, crate::telemetry::NullSink> =
            BoundedQueue::new(QueueKind::Report);

        for value in 1..=3 {
            queue.enqueue(value).expect("room for value");
        }
        assert_eq!(queue.dequeue(), Ok(1));
        queue.enqueue(4).expect("room after dequeue");
        queue.enqueue(5).expect("room to fill");
        assert!(queue.is_full());

        let drained: heapless::Vec<u32, 4> =
            core::iter::from_fn(|| queue.dequeue().ok()).collect();
        assert_eq!(drained.as_slice(), &[2, 3, 4, 5]);
    }

    #[test]
    fn full_queue_rejects_and_reports() {
        let sink = LastLine::default();
        let mut queue: BoundedQueue<u8, 2, &LastLine> = BoundedQueue::new(QueueKind::TrialSummary);
        queue.set_sink(&sink);

        queue.enqueue(1).expect("first");
        queue.enqueue(2).expect("second");
        assert_eq!(queue.enqueue(3), Err(QueueError::Full));
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.overflow_count(), 1);
        assert_eq!(
            sink.line.borrow().as_ref().map(LineBuffer::as_str),
            Some("E,Trial summary queue is full. Cannot write to queue.")
        );
        assert_eq!(queue.peek(), Some(&1));
    }

    #[test]
    fn empty_dequeue_reports_underflow() {
        let sink = LastLine::default();
        let mut queue: BoundedQueue<u8, 2, &LastLine> = BoundedQueue::new(QueueKind::Report);

        // Without a sink nothing is written.
        assert_eq!(queue.dequeue(), Err(QueueError::Empty));
        assert_eq!(*sink.lines.borrow(), 0);

        queue.set_sink(&sink);
        assert_eq!(queue.dequeue(), Err(QueueError::Empty));
        assert_eq!(
            sink.line.borrow().as_ref().map(LineBuffer::as_str),
            Some("E,Can NOT pop item from report queue because queue is empty.")
        );
    }
}
