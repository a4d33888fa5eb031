//! Architecture selection.
//!
//! `TargetArch` resolves to the implementation for the compilation target:
//! the Armv8 backend on aarch64, and a host stand-in everywhere else so the
//! machine-independent kernel builds and unit-tests on a development
//! machine.

pub mod interface;

pub use interface::Arch;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", not(test)))] {
        mod arm;
        pub use arm::Armv8 as TargetArch;
    } else {
        mod host;
        pub use host::Host as TargetArch;
    }
}
