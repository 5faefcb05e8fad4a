use core::mem::MaybeUninit;
use core::ptr;

use super::Io;

/// A word that is shared with hardware. Every access is volatile, so the compiler neither caches
/// reads nor merges or reorders writes to it.
#[repr(transparent)]
pub struct Mmio<T> {
    value: MaybeUninit<T>,
}

impl<T> Mmio<T> {
    /// Creates an in-memory word with an initial value. Useful for structures that live in
    /// DMA-visible RAM rather than in a register block.
    pub const fn new(value: T) -> Self {
        Self {
            value: MaybeUninit::new(value),
        }
    }
}

impl<T: Copy + Default> Default for Mmio<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy
        + PartialEq
        + core::ops::BitAnd<Output = T>
        + core::ops::BitOr<Output = T>
        + core::ops::Not<Output = T>,
{
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        unsafe { ptr::read_volatile(self.value.as_ptr()) }
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        unsafe { ptr::write_volatile(self.value.as_mut_ptr(), value) };
    }
}

impl<T: Copy + core::fmt::Debug> core::fmt::Debug for Mmio<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let value = unsafe { ptr::read_volatile(self.value.as_ptr()) };
        f.debug_tuple("Mmio").field(&value).finish()
    }
}
