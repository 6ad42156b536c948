//! Interrupt masking around flash operations.
//!
//! Issuing an erase or write must not be interleaved with an interrupt that
//! might run from the same flash bank.  Sections nest: interrupts go off when
//! the outermost section is entered and come back on only when it is left.

/// Board specific interrupt control.
pub trait InterruptControl {
    fn disable(&mut self);
    fn enable(&mut self);
}

/// For hosts, and for parts with nothing to mask.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    fn disable(&mut self) {}
    fn enable(&mut self) {}
}

impl<T: InterruptControl + ?Sized> InterruptControl for &mut T {
    fn disable(&mut self) {
        (**self).disable()
    }
    fn enable(&mut self) {
        (**self).enable()
    }
}

/// Nesting counter around an [`InterruptControl`].
#[derive(Debug)]
pub struct Nesting<I> {
    irq: I,
    depth: u32,
}

impl<I: InterruptControl> Nesting<I> {
    pub fn new(irq: I) -> Nesting<I> {
        Nesting { irq, depth: 0 }
    }

    pub fn enter(&mut self) -> CriticalSection<'_, I> {
        if self.depth == 0 {
            self.irq.disable();
        }
        self.depth += 1;
        CriticalSection { nesting: self }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn into_inner(self) -> I {
        self.irq
    }
}

/// Interrupts stay masked while this lives.
pub struct CriticalSection<'a, I: InterruptControl> {
    nesting: &'a mut Nesting<I>,
}

impl<I: InterruptControl> CriticalSection<'_, I> {
    /// Open a nested section.
    pub fn enter(&mut self) -> CriticalSection<'_, I> {
        self.nesting.enter()
    }
}

impl<I: InterruptControl> Drop for CriticalSection<'_, I> {
    fn drop(&mut self) {
        self.nesting.depth -= 1;
        if self.nesting.depth == 0 {
            self.nesting.irq.enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Vec<bool>,
    }

    impl InterruptControl for Recorder {
        fn disable(&mut self) {
            self.log.push(false);
        }
        fn enable(&mut self) {
            self.log.push(true);
        }
    }

    #[test]
    fn nested_sections() {
        let mut n = Nesting::new(Recorder::default());
        {
            let mut outer = n.enter();
            {
                let mut inner = outer.enter();
                let _innermost = inner.enter();
            }
        }
        assert_eq!(n.depth(), 0);
        assert_eq!(n.into_inner().log, vec![false, true]);
    }
}
