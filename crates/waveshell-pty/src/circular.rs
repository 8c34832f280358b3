use std::sync::Mutex;

/// A fixed-capacity ring buffer that never loses the newest bytes written.
///
/// `total_written` is a monotonic counter of every byte ever pushed, so readers can compute
/// how many bytes were dropped off the front (`total_written - buf.len()`) and detect a gap
/// against a previous read. Used for both the UI-facing pty log and the internal
/// password-prompt detector (spec.md invariant 5).
pub struct CircularBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    buf: Vec<u8>,
    total_written: u64,
}

/// A point-in-time view of the buffer: the offset of its first byte, and the bytes
/// currently held.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        CircularBuffer {
            inner: Mutex::new(Inner {
                capacity,
                buf: Vec::with_capacity(capacity),
                total_written: 0,
            }),
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_written += bytes.len() as u64;

        if bytes.len() >= inner.capacity {
            // Only the tail fits; everything before it is already gone.
            let start = bytes.len() - inner.capacity;
            inner.buf = bytes[start..].to_vec();
            return;
        }

        let capacity = inner.capacity;
        inner.buf.extend_from_slice(bytes);
        if inner.buf.len() > capacity {
            let overflow = inner.buf.len() - capacity;
            inner.buf.drain(0..overflow);
        }
    }

    /// Returns `(offset = total_written - buf.len(), buf)`.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        Snapshot {
            offset: inner.total_written - inner.buf.len() as u64,
            data: inner.buf.clone(),
        }
    }

    pub fn total_written(&self) -> u64 {
        self.inner.lock().unwrap().total_written
    }

    /// The last line after the most recent newline, used for prompt detection. Returns an
    /// empty string if the buffer holds no newline (prompt is still on the first line).
    pub fn last_line(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let tail = match inner.buf.iter().rposition(|&b| b == b'\n') {
            Some(idx) => &inner.buf[idx + 1..],
            None => &inner.buf[..],
        };
        String::from_utf8_lossy(tail).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_loses_newest_bytes() {
        let cb = CircularBuffer::new(64 * 1024);
        let total = 64 * 1024 + 100;
        let chunk = vec![b'a'; 4096];
        let mut written = 0usize;
        while written < total {
            let n = chunk.len().min(total - written);
            cb.write(&chunk[..n]);
            written += n;
        }
        assert_eq!(cb.total_written(), total as u64);
        let snap = cb.snapshot();
        assert_eq!(snap.offset, total as u64 - 64 * 1024);
        assert_eq!(snap.data.len(), 64 * 1024);
    }

    #[test]
    fn last_line_finds_prompt() {
        let cb = CircularBuffer::new(1024);
        cb.write(b"some banner\nroot@host's password: ");
        assert_eq!(cb.last_line(), "root@host's password: ");
    }

    #[test]
    fn small_writes_accumulate_before_wrap() {
        let cb = CircularBuffer::new(10);
        cb.write(b"abc");
        cb.write(b"def");
        assert_eq!(cb.snapshot().data, b"abcdef");
        cb.write(b"ghijklmno"); // pushes total past capacity
        let snap = cb.snapshot();
        assert_eq!(snap.data.len(), 10);
        assert_eq!(snap.offset, cb.total_written() - 10);
    }
}
