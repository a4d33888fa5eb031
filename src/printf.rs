//! Kernel console output and the panic handler.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(test))]
use crate::arch::{Arch, TargetArch};
#[cfg(not(test))]
use crate::lock::SpinLock;

/// Raised by the first panicking core; the idle loops spin down on it.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

#[cfg(not(test))]
static PRINT_LOCK: SpinLock<()> = SpinLock::new("print", ());

#[cfg(not(test))]
struct Writer;

#[cfg(not(test))]
impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            crate::console::uart_putc(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    #[cfg(test)]
    {
        std::print!("{}", args);
    }
    #[cfg(not(test))]
    {
        use core::fmt::Write;
        if PANICKED.load(Ordering::Relaxed) {
            // Panic output must not deadlock on the print lock.
            let _ = Writer.write_fmt(args);
        } else {
            let _lock = PRINT_LOCK.lock();
            let _ = Writer.write_fmt(args);
        }
    }
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::printf::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {{
        $crate::printf::_print(core::format_args!($($arg)*));
        $crate::kprint!("\n");
    }};
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    PANICKED.store(true, Ordering::Relaxed);
    kprintln!("kernel panic: {}", info);
    loop {
        TargetArch::wait_for_interrupt();
    }
}
