//! Console device.
//!
//! Writes push bytes straight to the UART. Reads are line buffered with
//! canonical editing: backspace/DEL erases one byte, ctrl-U erases back
//! to the previous newline, ctrl-D ends the input, and carriage returns
//! become newlines. Input sits in a small ring; when it overflows, new
//! bytes are silently dropped.

use spin::Once;

use crate::lock::SpinLock;
use crate::param::INPUT_BUF;
use crate::sem::Semaphore;

/// What the UART driver exposes to the kernel.
pub trait CharDevice: Send + Sync {
    fn putc(&self, c: u8);
    fn getc(&self) -> Option<u8>;
}

const fn ctrl(c: u8) -> u8 {
    c - b'@'
}

const CTRL_D: u8 = ctrl(b'D');
const CTRL_U: u8 = ctrl(b'U');
const CTRL_H: u8 = ctrl(b'H');
const DEL: u8 = 0x7f;

pub struct Console {
    uart: &'static dyn CharDevice,
    input: SpinLock<Input>,

    /// Posted whenever a line is committed.
    readable: Semaphore,
}

struct Input {
    buf: [u8; INPUT_BUF],

    /// Consumed up to here.
    r: u64,

    /// Committed (visible to readers) up to here.
    w: u64,

    /// Edited up to here; `[w, e)` is the line being typed.
    e: u64,
}

impl Console {
    pub fn new(uart: &'static dyn CharDevice) -> Self {
        Self {
            uart,
            input: SpinLock::new(
                "console",
                Input {
                    buf: [0; INPUT_BUF],
                    r: 0,
                    w: 0,
                    e: 0,
                },
            ),
            readable: Semaphore::new("console readable", 0),
        }
    }

    pub fn write(&self, src: &[u8]) -> usize {
        let _lock = self.input.lock();
        for &b in src {
            self.uart.putc(b);
        }
        src.len()
    }

    /// Reads one line (or `dst.len()` bytes, whichever is shorter).
    /// Returns 0 when the input ends with ctrl-D before any byte. Fails
    /// if the process is killed while waiting for input.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut input = self.input.lock();
        let mut n = 0;
        while n < dst.len() {
            while input.r == input.w {
                drop(input);
                if !self.readable.wait() {
                    return Err(());
                }
                input = self.input.lock();
            }
            let c = input.buf[(input.r % INPUT_BUF as u64) as usize];
            input.r += 1;
            if c == CTRL_D {
                if n > 0 {
                    // Push the end-of-input back for the next read.
                    input.r -= 1;
                }
                break;
            }
            dst[n] = c;
            n += 1;
            if c == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    /// Drains the UART on a receive interrupt, applying the line
    /// discipline.
    pub fn intr(&self) {
        let mut input = self.input.lock();
        while let Some(c) = self.uart.getc() {
            let c = if c == b'\r' { b'\n' } else { c };
            match c {
                CTRL_H | DEL => {
                    if input.e != input.w {
                        input.e -= 1;
                        self.rubout();
                    }
                }
                CTRL_U => {
                    while input.e != input.w
                        && input.buf[((input.e - 1) % INPUT_BUF as u64) as usize] != b'\n'
                    {
                        input.e -= 1;
                        self.rubout();
                    }
                }
                _ => {
                    if input.e - input.r >= INPUT_BUF as u64 {
                        // Ring full: drop.
                        continue;
                    }
                    let idx = (input.e % INPUT_BUF as u64) as usize;
                    input.buf[idx] = c;
                    input.e += 1;
                    self.uart.putc(c);
                    if c == b'\n' || c == CTRL_D {
                        input.w = input.e;
                        self.readable.post();
                    }
                }
            }
        }
    }

    fn rubout(&self) {
        self.uart.putc(CTRL_H);
        self.uart.putc(b' ');
        self.uart.putc(CTRL_H);
    }
}

static CONSOLE: Once<Console> = Once::new();

/// Installs the console over the UART. Called once at boot.
pub fn init(uart: &'static dyn CharDevice) {
    CONSOLE.call_once(|| Console::new(uart));
}

pub fn console() -> Option<&'static Console> {
    CONSOLE.get()
}

/// Raw output byte for `kprint!`; dropped before the console exists.
pub fn uart_putc(b: u8) {
    if let Some(c) = CONSOLE.get() {
        c.uart.putc(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockUart {
        rx: Mutex<VecDeque<u8>>,
        tx: Mutex<Vec<u8>>,
    }

    impl MockUart {
        fn leak(input: &[u8]) -> &'static Self {
            Box::leak(Box::new(Self {
                rx: Mutex::new(input.iter().copied().collect()),
                tx: Mutex::new(Vec::new()),
            }))
        }
    }

    impl CharDevice for MockUart {
        fn putc(&self, c: u8) {
            self.tx.lock().unwrap().push(c);
        }

        fn getc(&self) -> Option<u8> {
            self.rx.lock().unwrap().pop_front()
        }
    }

    fn console_with(input: &[u8]) -> Console {
        let uart = MockUart::leak(input);
        let c = Console::new(uart);
        c.intr();
        c
    }

    #[test]
    fn line_read_stops_at_newline() {
        let c = console_with(b"hi\nrest\n");
        let mut buf = [0u8; 32];
        assert_eq!(c.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"hi\n");
        assert_eq!(c.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"rest\n");
    }

    #[test]
    fn backspace_erases_one_byte() {
        let c = console_with(b"ab\x7fc\n");
        let mut buf = [0u8; 32];
        let n = c.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ac\n");
    }

    #[test]
    fn ctrl_u_erases_the_line() {
        let c = console_with(b"oops\x15ok\n");
        let mut buf = [0u8; 32];
        let n = c.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok\n");
    }

    #[test]
    fn ctrl_d_ends_input() {
        let c = console_with(b"abc\x04");
        let mut buf = [0u8; 32];
        // The first read returns the bytes before ctrl-D...
        assert_eq!(c.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        // ...and the pushed-back ctrl-D makes the next read EOF.
        assert_eq!(c.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn carriage_return_becomes_newline() {
        let c = console_with(b"x\r");
        let mut buf = [0u8; 32];
        let n = c.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"x\n");
    }

    #[test]
    fn overflow_drops_input() {
        // One full committed line, then a second line that arrives while
        // the ring is full and is dropped wholesale.
        let mut long = vec![b'a'; INPUT_BUF - 1];
        long.push(b'\n');
        long.extend(std::iter::repeat(b'b').take(50));
        long.push(b'\n');
        let c = console_with(&long);
        let mut buf = [0u8; 2 * INPUT_BUF];
        let n = c.read(&mut buf).unwrap();
        assert_eq!(n, INPUT_BUF);
        assert!(buf[..INPUT_BUF - 1].iter().all(|&b| b == b'a'));
        assert_eq!(buf[INPUT_BUF - 1], b'\n');
    }
}
