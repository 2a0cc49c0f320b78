//! Stackful coroutines driving one connection each, with deferred cleanup
//! hooks that run in LIFO order when the coroutine is torn down.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::io;
use std::rc::Rc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

/// Stack size for connection coroutines. Virtual memory lazy-commits pages,
/// so tens of thousands of 64 KiB stacks are feasible.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// What a connection coroutine asks of its worker when it suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The coroutine is done or unrecoverably failed; destroy the connection.
    Abort,
    /// One request completed; resume again on the next readiness event.
    MayResume,
    /// The pipeline needs more input bytes.
    NeedRead,
    /// Response bytes are pending; wake on write readiness.
    NeedWrite,
}

type DeferStack = Rc<RefCell<Vec<Box<dyn FnOnce()>>>>;

/// A suspendable execution context owned by a worker.
///
/// `Coro` is `!Send`: a coroutine lives and dies on the thread that spawned
/// it.
pub struct Coro {
    inner: Coroutine<(), Disposition, Disposition>,
    defers: DeferStack,
}

impl Coro {
    /// Spawn a coroutine on a fresh fixed-size stack. The body runs on the
    /// first [`resume`](Coro::resume).
    pub fn spawn<F>(body: F) -> io::Result<Coro>
    where
        F: FnOnce(&CoroRef<'_>) -> Disposition + 'static,
    {
        let defers: DeferStack = Rc::new(RefCell::new(Vec::new()));
        let hooks = Rc::clone(&defers);
        let stack = DefaultStack::new(DEFAULT_STACK_SIZE)?;

        let inner = Coroutine::with_stack(stack, move |yielder, ()| {
            body(&CoroRef {
                yielder,
                defers: hooks,
            })
        });

        Ok(Coro { inner, defers })
    }

    /// Run the coroutine until it suspends again, returning the disposition
    /// it yielded. A returning body is treated as its final disposition.
    pub fn resume(&mut self) -> Disposition {
        match self.inner.resume(()) {
            CoroutineResult::Yield(disposition) => disposition,
            CoroutineResult::Return(disposition) => disposition,
        }
    }

    /// Whether the body has run to completion.
    pub fn done(&self) -> bool {
        self.inner.done()
    }

    /// Tear the coroutine down: run every outstanding deferred hook, most
    /// recent first, then unwind the stack if the body is still suspended so
    /// its locals are dropped.
    pub fn free(mut self) {
        run_deferred(&self.defers, 0);
        if !self.inner.done() {
            self.inner.force_unwind();
        }
    }
}

impl Debug for Coro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coro")
            .field("done", &self.inner.done())
            .field("deferred", &self.defers.borrow().len())
            .finish()
    }
}

/// Execution context handed to a coroutine body. Suspending and registering
/// cleanup hooks go through this.
pub struct CoroRef<'y> {
    yielder: &'y Yielder<(), Disposition>,
    defers: DeferStack,
}

impl CoroRef<'_> {
    /// Suspend with `disposition`; returns when the worker resumes us.
    pub fn yield_with(&self, disposition: Disposition) {
        self.yielder.suspend(disposition);
    }

    /// Register a cleanup hook. Hooks run in LIFO order, either through
    /// [`run_deferred`](CoroRef::run_deferred) or when the coroutine is
    /// freed.
    pub fn defer<F: FnOnce() + 'static>(&self, hook: F) {
        self.defers.borrow_mut().push(Box::new(hook));
    }

    /// Mark the current position of the deferred-hook stack.
    pub fn deferred_generation(&self) -> usize {
        self.defers.borrow().len()
    }

    /// Run all hooks registered at or after `generation`, most recent first.
    pub fn run_deferred(&self, generation: usize) {
        run_deferred(&self.defers, generation);
    }
}

impl Debug for CoroRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroRef")
            .field("deferred", &self.defers.borrow().len())
            .finish()
    }
}

fn run_deferred(defers: &DeferStack, generation: usize) {
    // Pop one hook at a time with the borrow released so a hook may itself
    // register further cleanups.
    loop {
        let hook = {
            let mut hooks = defers.borrow_mut();
            if hooks.len() <= generation {
                break;
            }
            hooks.pop()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn yields_and_resumes_in_order() {
        let mut coro = Coro::spawn(|ctx| {
            ctx.yield_with(Disposition::NeedRead);
            ctx.yield_with(Disposition::MayResume);
            ctx.yield_with(Disposition::NeedWrite);
            Disposition::Abort
        })
        .unwrap();

        assert_eq!(Disposition::NeedRead, coro.resume());
        assert_eq!(Disposition::MayResume, coro.resume());
        assert_eq!(Disposition::NeedWrite, coro.resume());
        assert_eq!(Disposition::Abort, coro.resume());
        assert!(coro.done());
        coro.free();
    }

    #[test]
    fn deferred_hooks_run_lifo_on_free() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&order);

        let mut coro = Coro::spawn(move |ctx| {
            for tag in ["first", "second", "third"] {
                let order = Rc::clone(&seen);
                ctx.defer(move || order.borrow_mut().push(tag));
            }
            ctx.yield_with(Disposition::MayResume);
            Disposition::Abort
        })
        .unwrap();

        assert_eq!(Disposition::MayResume, coro.resume());
        assert!(order.borrow().is_empty());

        coro.free();
        assert_eq!(vec!["third", "second", "first"], *order.borrow());
    }

    #[test]
    fn run_deferred_only_unwinds_past_the_generation_mark() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&order);

        let mut coro = Coro::spawn(move |ctx| {
            let outer = Rc::clone(&seen);
            ctx.defer(move || outer.borrow_mut().push("outer"));

            let generation = ctx.deferred_generation();
            for tag in ["a", "b"] {
                let order = Rc::clone(&seen);
                ctx.defer(move || order.borrow_mut().push(tag));
            }
            ctx.run_deferred(generation);

            ctx.yield_with(Disposition::MayResume);
            Disposition::Abort
        })
        .unwrap();

        assert_eq!(Disposition::MayResume, coro.resume());
        // Per-request hooks ran LIFO, the older hook did not.
        assert_eq!(vec!["b", "a"], *order.borrow());

        coro.free();
        assert_eq!(vec!["b", "a", "outer"], *order.borrow());
    }

    #[test]
    fn free_unwinds_a_suspended_stack() {
        struct Flag(Rc<Cell<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let flag = Flag(Rc::clone(&dropped));

        let mut coro = Coro::spawn(move |ctx| {
            let _guard = flag;
            loop {
                ctx.yield_with(Disposition::NeedRead);
            }
        })
        .unwrap();

        assert_eq!(Disposition::NeedRead, coro.resume());
        assert!(!dropped.get());

        coro.free();
        assert!(dropped.get());
    }

    #[test]
    fn free_without_first_resume_is_clean() {
        let coro = Coro::spawn(|ctx| {
            ctx.yield_with(Disposition::MayResume);
            Disposition::Abort
        })
        .unwrap();
        coro.free();
    }
}
