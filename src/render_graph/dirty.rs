//! Dirty-tracking register
//!
//! Each pass (and the renderer) owns one register over its own `bitflags` type.
//! Mutators set flags; `prepare()` consumes them once per frame.

use bitflags::Flags;

/// Set of change flags over the named constants of `F`.
///
/// The aggregate `any()` is derived from the flag bits, so it can never
/// disagree with the individual flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegister<F: Flags + Copy> {
    flags: F,
}

impl<F: Flags + Copy> DirtyRegister<F> {
    /// Create a register with every flag cleared
    pub fn new() -> Self {
        Self { flags: F::empty() }
    }

    /// Mark `flag` dirty
    pub fn set(&mut self, flag: F) {
        self.flags.insert(flag);
    }

    /// Clear `flag` only
    pub fn unset(&mut self, flag: F) {
        self.flags.remove(flag);
    }

    /// Whether `flag` is dirty
    pub fn get(&self, flag: F) -> bool {
        self.flags.contains(flag)
    }

    /// Whether any of the bits in `flags` is dirty
    pub fn get_any(&self, flags: F) -> bool {
        self.flags.intersects(flags)
    }

    pub fn any(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Clear every flag
    pub fn reset(&mut self) {
        self.flags = F::empty();
    }

    /// Mark every known flag dirty
    pub fn set_all(&mut self) {
        self.flags = F::all();
    }

    /// Return whether anything was dirty, then reset
    pub fn consume(&mut self) -> bool {
        let any = self.any();
        self.reset();
        any
    }

    pub fn flags(&self) -> F {
        self.flags
    }
}

impl<F: Flags + Copy> Default for DirtyRegister<F> {
    fn default() -> Self {
        Self::new()
    }
}
