//! Bounded replay history for one PTY session.
//!
//! A sequence-numbered ring of byte chunks. Appends trim from the head at
//! append time, so the retained bytes are always the most recent
//! `HISTORY_CAP_BYTES`. Any number of independent cursors can read without
//! copying the ring; readers that fall behind the head are clamped forward.
//! Reads block on a condvar until data arrives, the stream closes, or the
//! timeout expires.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;

use crate::common::mutex_lock_or_recover;
use crate::common::rwlock_read_or_recover;
use crate::common::rwlock_write_or_recover;

pub const HISTORY_CAP_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCursor {
    pub seq: u64,
}

#[derive(Debug)]
pub struct StreamRead {
    pub data: Vec<u8>,
    pub closed: bool,
}

struct HistoryState {
    buffer: VecDeque<Bytes>,
    buffer_len: usize,
    base_seq: u64,
    next_seq: u64,
    closed: bool,
    last_output: Option<Instant>,
}

pub struct HistoryBuffer {
    state: RwLock<HistoryState>,
    wait_lock: Mutex<()>,
    cv: Condvar,
    cap_bytes: usize,
}

impl HistoryBuffer {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            state: RwLock::new(HistoryState {
                buffer: VecDeque::new(),
                buffer_len: 0,
                base_seq: 0,
                next_seq: 0,
                closed: false,
                last_output: None,
            }),
            wait_lock: Mutex::new(()),
            cv: Condvar::new(),
            cap_bytes,
        }
    }

    pub fn push(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let _wait_guard = mutex_lock_or_recover(&self.wait_lock, "history waiters");
        let mut state = rwlock_write_or_recover(&self.state, "history state");
        state.last_output = Some(Instant::now());
        state.buffer_len = state.buffer_len.saturating_add(data.len());
        state.next_seq = state.next_seq.saturating_add(data.len() as u64);
        state.buffer.push_back(data);

        while state.buffer_len > self.cap_bytes {
            let excess = state.buffer_len - self.cap_bytes;
            let Some(chunk) = state.buffer.pop_front() else {
                break;
            };
            if chunk.len() <= excess {
                let len = chunk.len();
                state.buffer_len = state.buffer_len.saturating_sub(len);
                state.base_seq = state.base_seq.saturating_add(len as u64);
                continue;
            }

            let keep = chunk.slice(excess..);
            state.buffer.push_front(keep);
            state.buffer_len = state.buffer_len.saturating_sub(excess);
            state.base_seq = state.base_seq.saturating_add(excess as u64);
            break;
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Mark the stream closed; no further output will arrive. Blocked
    /// readers wake and observe `closed`.
    pub fn close(&self) {
        let _wait_guard = mutex_lock_or_recover(&self.wait_lock, "history waiters");
        let mut state = rwlock_write_or_recover(&self.state, "history state");
        state.closed = true;
        drop(state);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        rwlock_read_or_recover(&self.state, "history state").closed
    }

    pub fn len(&self) -> usize {
        rwlock_read_or_recover(&self.state, "history state").buffer_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_output_instant(&self) -> Option<Instant> {
        rwlock_read_or_recover(&self.state, "history state").last_output
    }

    /// Cursor positioned after everything currently buffered.
    pub fn latest_cursor(&self) -> StreamCursor {
        StreamCursor {
            seq: rwlock_read_or_recover(&self.state, "history state").next_seq,
        }
    }

    /// Cursor positioned at the oldest retained byte.
    pub fn oldest_cursor(&self) -> StreamCursor {
        StreamCursor {
            seq: rwlock_read_or_recover(&self.state, "history state").base_seq,
        }
    }

    /// The whole retained window as one contiguous byte sequence, plus the
    /// cursor to continue reading live output from.
    pub fn snapshot(&self) -> (Vec<u8>, StreamCursor) {
        let state = rwlock_read_or_recover(&self.state, "history state");
        let mut data = Vec::with_capacity(state.buffer_len);
        for chunk in state.buffer.iter() {
            data.extend_from_slice(chunk);
        }
        (
            data,
            StreamCursor {
                seq: state.next_seq,
            },
        )
    }

    /// Read up to `max_bytes` at `cursor`, blocking up to `timeout` for new
    /// data. A `None` timeout blocks until data or close.
    pub fn read(
        &self,
        cursor: &mut StreamCursor,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> StreamRead {
        let max_bytes = max_bytes.max(1);

        let mut guard = mutex_lock_or_recover(&self.wait_lock, "history waiters");
        loop {
            let state = rwlock_read_or_recover(&self.state, "history state");
            if state.next_seq > cursor.seq || state.closed {
                break;
            }
            drop(state);

            if let Some(wait) = timeout {
                let (new_guard, result) = self
                    .cv
                    .wait_timeout(guard, wait)
                    .unwrap_or_else(|e| e.into_inner());
                guard = new_guard;
                if result.timed_out() {
                    break;
                }
            } else {
                guard = self.cv.wait(guard).unwrap_or_else(|e| e.into_inner());
            }
        }
        drop(guard);

        let state = rwlock_read_or_recover(&self.state, "history state");
        let closed = state.closed;

        if cursor.seq < state.base_seq {
            cursor.seq = state.base_seq;
        }

        let offset = (cursor.seq - state.base_seq) as usize;
        let available = state.buffer_len.saturating_sub(offset);
        let read_len = available.min(max_bytes);

        let mut data = Vec::with_capacity(read_len);
        if read_len > 0 {
            let mut remaining = read_len;
            let mut skip = offset;
            for chunk in state.buffer.iter() {
                if remaining == 0 {
                    break;
                }
                if skip >= chunk.len() {
                    skip -= chunk.len();
                    continue;
                }
                let start = skip;
                let take = (chunk.len() - start).min(remaining);
                data.extend_from_slice(&chunk[start..start + take]);
                remaining -= take;
                skip = 0;
            }
        }

        cursor.seq = cursor.seq.saturating_add(read_len as u64);

        StreamRead { data, closed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_returns_data_and_advances_cursor() {
        let buffer = HistoryBuffer::new(16);
        let mut cursor = StreamCursor::default();

        buffer.push(Bytes::from_static(b"hello"));
        let read = buffer.read(&mut cursor, 16, Some(Duration::ZERO));

        assert_eq!(read.data, b"hello");
        assert_eq!(cursor.seq, 5);
        assert!(!read.closed);
    }

    #[test]
    fn cap_retains_most_recent_bytes() {
        let buffer = HistoryBuffer::new(4);
        buffer.push(Bytes::from_static(b"abcdef"));

        assert_eq!(buffer.len(), 4);
        let (data, _) = buffer.snapshot();
        assert_eq!(data, b"cdef");

        // Appending n bytes to a full window keeps length at the cap.
        buffer.push(Bytes::from_static(b"gh"));
        assert_eq!(buffer.len(), 4);
        let (data, _) = buffer.snapshot();
        assert_eq!(data, b"efgh");
    }

    #[test]
    fn trim_spans_chunk_boundaries() {
        let buffer = HistoryBuffer::new(5);
        buffer.push(Bytes::from_static(b"abc"));
        buffer.push(Bytes::from_static(b"def"));
        buffer.push(Bytes::from_static(b"gh"));

        let (data, _) = buffer.snapshot();
        assert_eq!(data, b"defgh");
    }

    #[test]
    fn lagging_cursor_is_clamped_to_retained_window() {
        let buffer = HistoryBuffer::new(4);
        let mut cursor = StreamCursor::default();

        buffer.push(Bytes::from_static(b"abcdef"));
        let read = buffer.read(&mut cursor, 10, Some(Duration::ZERO));

        assert_eq!(read.data, b"cdef");
        assert_eq!(cursor.seq, 6);
    }

    #[test]
    fn read_blocks_until_push() {
        let buffer = Arc::new(HistoryBuffer::new(16));
        let mut cursor = StreamCursor::default();

        let writer = Arc::clone(&buffer);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.push(Bytes::from_static(b"ok"));
        });

        let read = buffer.read(&mut cursor, 16, Some(Duration::from_millis(500)));
        assert_eq!(read.data, b"ok");
    }

    #[test]
    fn close_wakes_blocked_readers() {
        let buffer = Arc::new(HistoryBuffer::new(16));
        let mut cursor = StreamCursor::default();

        let closer = Arc::clone(&buffer);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });

        let read = buffer.read(&mut cursor, 16, Some(Duration::from_millis(500)));
        assert!(read.closed);
        assert!(read.data.is_empty());
    }

    #[test]
    fn independent_cursors_see_the_same_bytes() {
        let buffer = HistoryBuffer::new(16);
        let mut cursor_a = StreamCursor::default();
        let mut cursor_b = StreamCursor::default();

        buffer.push(Bytes::from_static(b"hello"));

        let read_a = buffer.read(&mut cursor_a, 2, Some(Duration::ZERO));
        let read_b = buffer.read(&mut cursor_b, 16, Some(Duration::ZERO));

        assert_eq!(read_a.data, b"he");
        assert_eq!(read_b.data, b"hello");
    }

    #[test]
    fn push_updates_last_output_instant() {
        let buffer = HistoryBuffer::new(16);
        assert!(buffer.last_output_instant().is_none());
        buffer.push(Bytes::from_static(b"x"));
        assert!(buffer.last_output_instant().is_some());
    }

    #[test]
    fn snapshot_cursor_continues_after_window() {
        let buffer = HistoryBuffer::new(16);
        buffer.push(Bytes::from_static(b"abc"));

        let (data, mut cursor) = buffer.snapshot();
        assert_eq!(data, b"abc");

        buffer.push(Bytes::from_static(b"def"));
        let read = buffer.read(&mut cursor, 16, Some(Duration::ZERO));
        assert_eq!(read.data, b"def");
    }
}
