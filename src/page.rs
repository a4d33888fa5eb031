use core::ops::{Deref, DerefMut};

use crate::param::PAGE_SIZE;

/// A page-aligned, page-sized byte buffer.
#[repr(align(4096))]
pub struct Page {
    inner: [u8; PAGE_SIZE],
}

impl Page {
    pub const fn zeroed() -> Self {
        Self {
            inner: [0; PAGE_SIZE],
        }
    }
}

impl Deref for Page {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
