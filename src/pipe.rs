//! Pipes.
//!
//! A pipe is a fixed byte ring shared by one read end and one write end.
//! The indices only grow; `index % PIPE_SIZE` addresses the storage.
//! Readers block while the ring is empty and the write end is open;
//! writers block while it is full and the read end is open. Closing an
//! end wakes everyone on the other side. The ring itself is freed when
//! the last handle goes away.

use alloc::sync::Arc;

use crate::lock::SpinLock;
use crate::param::PIPE_SIZE;
use crate::sem::Semaphore;

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// Posted when bytes arrive or the write end closes.
    readable: Semaphore,

    /// Posted when space frees up or the read end closes.
    writable: Semaphore,
}

struct PipeInner {
    data: [u8; PIPE_SIZE],

    /// Bytes consumed so far.
    nread: u64,

    /// Bytes produced so far.
    nwrite: u64,

    readopen: bool,
    writeopen: bool,
}

impl Pipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPE_SIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            readable: Semaphore::new("pipe readable", 0),
            writable: Semaphore::new("pipe writable", 0),
        })
    }

    /// Reads up to `dst.len()` bytes. Returns 0 at end-of-file (write end
    /// closed and ring drained); fails if the read end itself is closed
    /// or the process is killed while waiting.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        if !inner.readopen {
            return Err(());
        }

        while inner.nread == inner.nwrite && inner.writeopen {
            drop(inner);
            if !self.readable.wait() {
                return Err(());
            }
            inner = self.inner.lock();
            if !inner.readopen {
                return Err(());
            }
        }

        let mut n = 0;
        while n < dst.len() && inner.nread != inner.nwrite {
            dst[n] = inner.data[(inner.nread % PIPE_SIZE as u64) as usize];
            inner.nread += 1;
            n += 1;
        }
        self.writable.post_all();
        Ok(n)
    }

    /// Writes all of `src`, blocking whenever the ring fills. Fails once
    /// the read end is closed; a kill while waiting returns the bytes
    /// written so far.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        if !inner.writeopen {
            return Err(());
        }

        let mut n = 0;
        while n < src.len() {
            if !inner.readopen {
                return Err(());
            }
            if inner.nwrite - inner.nread >= PIPE_SIZE as u64 {
                self.readable.post_all();
                drop(inner);
                if !self.writable.wait() {
                    return Ok(n);
                }
                inner = self.inner.lock();
            } else {
                let idx = (inner.nwrite % PIPE_SIZE as u64) as usize;
                inner.data[idx] = src[n];
                inner.nwrite += 1;
                n += 1;
            }
        }
        self.readable.post_all();
        Ok(n)
    }

    /// Closes one end, waking all waiters on the other side.
    pub fn close(&self, writable_end: bool) {
        let mut inner = self.inner.lock();
        if writable_end {
            inner.writeopen = false;
            self.readable.post_all();
        } else {
            inner.readopen = false;
            self.writable.post_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let p = Pipe::new();
        assert_eq!(p.write(b"abc").unwrap(), 3);
        assert_eq!(p.write(b"de").unwrap(), 2);
        let mut buf = [0u8; 8];
        let n = p.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcde");
    }

    #[test]
    fn drain_then_refill_preserves_order() {
        let p = Pipe::new();
        // Fill the ring exactly.
        let big = [7u8; PIPE_SIZE];
        assert_eq!(p.write(&big).unwrap(), PIPE_SIZE);
        let mut buf = [0u8; 100];
        assert_eq!(p.read(&mut buf).unwrap(), 100);
        // Space for exactly 100 more; the indices wrap.
        assert_eq!(p.write(b"xy").unwrap(), 2);
        let mut rest = vec![0u8; PIPE_SIZE];
        assert_eq!(p.read(&mut rest).unwrap(), PIPE_SIZE - 100 + 2);
        assert_eq!(&rest[PIPE_SIZE - 100..PIPE_SIZE - 98], b"xy");
    }

    #[test]
    fn eof_after_write_end_closes() {
        let p = Pipe::new();
        p.write(b"tail").unwrap();
        p.close(true);
        let mut buf = [0u8; 8];
        assert_eq!(p.read(&mut buf).unwrap(), 4);
        // Drained and the write end is gone: end-of-file.
        assert_eq!(p.read(&mut buf).unwrap(), 0);
        assert_eq!(p.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_fails_once_read_end_closes() {
        let p = Pipe::new();
        p.close(false);
        assert!(p.write(b"x").is_err());
    }

    #[test]
    fn read_fails_on_own_closed_end() {
        let p = Pipe::new();
        p.close(false);
        let mut buf = [0u8; 1];
        assert!(p.read(&mut buf).is_err());
    }
}
