//! Cooperative continuations.
//!
//! Every inbound event — a page fault, a system call — is served by a
//! continuation: a future spawned onto a single-threaded run queue. A
//! continuation runs until it completes or suspends; nothing preempts it, so
//! shared state is consistent at every suspension point. Suspension happens
//! in exactly three places: [`yield_now`] around backing-store I/O, waiting
//! on a [`WaitQueue`] for an in-flight eviction of the same page, and
//! nowhere else. A continuation that resumes must re-validate anything it
//! looked up before suspending; the world may have changed under it.
//!
//! Killing a process cannot tear a continuation out of the middle of a
//! paging operation. Instead each continuation carries a [`Cancellation`]
//! token registered with its process; `kill` fires the token, and the
//! continuation observes it at its next suspension point and unwinds,
//! releasing pins and partial state on the way out.

use crate::KernelError;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::mem::ManuallyDrop;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

struct ReadyQueue {
    queue: RefCell<VecDeque<u64>>,
}

impl ReadyQueue {
    fn push(&self, id: u64) {
        let mut q = self.queue.borrow_mut();
        if !q.contains(&id) {
            q.push_back(id);
        }
    }
}

struct WakeSlot {
    id: u64,
    ready: Rc<ReadyQueue>,
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(raw_clone, raw_wake, raw_wake_by_ref, raw_drop);

fn raw_clone(data: *const ()) -> RawWaker {
    unsafe { Rc::increment_strong_count(data as *const WakeSlot) };
    RawWaker::new(data, &VTABLE)
}

fn raw_wake(data: *const ()) {
    let slot = unsafe { Rc::from_raw(data as *const WakeSlot) };
    slot.ready.push(slot.id);
}

fn raw_wake_by_ref(data: *const ()) {
    let slot = ManuallyDrop::new(unsafe { Rc::from_raw(data as *const WakeSlot) });
    slot.ready.push(slot.id);
}

fn raw_drop(data: *const ()) {
    drop(unsafe { Rc::from_raw(data as *const WakeSlot) });
}

/// The run queue driving all continuations, one at a time.
pub struct Scheduler {
    ready: Rc<ReadyQueue>,
    tasks: RefCell<BTreeMap<u64, Pin<Box<dyn Future<Output = ()>>>>>,
    next: Cell<u64>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            ready: Rc::new(ReadyQueue {
                queue: RefCell::new(VecDeque::new()),
            }),
            tasks: RefCell::new(BTreeMap::new()),
            next: Cell::new(1),
        }
    }

    /// Queue a new continuation. It runs when [`Scheduler::run`] next reaches
    /// it.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        let id = self.next.get();
        self.next.set(id + 1);
        self.tasks.borrow_mut().insert(id, Box::pin(fut));
        self.ready.push(id);
    }

    /// Continuations that exist but have not completed.
    pub fn live(&self) -> usize {
        self.tasks.borrow().len()
    }

    fn waker_for(&self, id: u64) -> Waker {
        let slot = Rc::new(WakeSlot {
            id,
            ready: self.ready.clone(),
        });
        unsafe { Waker::from_raw(RawWaker::new(Rc::into_raw(slot) as *const (), &VTABLE)) }
    }

    /// Drive runnable continuations until none is runnable. Continuations
    /// blocked on a [`WaitQueue`] stay parked; a later wake makes them
    /// runnable again on the next call.
    pub fn run(&self) {
        loop {
            let id = self.ready.queue.borrow_mut().pop_front();
            let Some(id) = id else { break };
            let task = self.tasks.borrow_mut().remove(&id);
            let Some(mut task) = task else { continue };
            let waker = self.waker_for(id);
            let mut cx = Context::from_waker(&waker);
            match task.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {}
                Poll::Pending => {
                    self.tasks.borrow_mut().insert(id, task);
                }
            }
        }
    }

    /// Spawn `fut`, run the queue to quiescence, and hand back its result.
    /// `None` means the future is still parked — every waker it waits on is
    /// dry. Test harness convenience.
    pub fn block_on<T: 'static>(&self, fut: impl Future<Output = T> + 'static) -> Option<T> {
        let out: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let slot = out.clone();
        self.spawn(async move {
            let v = fut.await;
            *slot.borrow_mut() = Some(v);
        });
        self.run();
        out.borrow_mut().take()
    }
}

/// Suspend the running continuation once, letting every other runnable
/// continuation proceed before it resumes.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// A queue of continuations parked until an event fires.
///
/// Wakeups are level-style: `wake_all` bumps a generation counter, so a
/// waiter that registers and is woken in the same turn never misses the
/// event. Woken waiters re-resolve whatever they were waiting for; the
/// queue promises nothing about the state of the world.
pub struct WaitQueue {
    generation: Cell<u64>,
    wakers: RefCell<Vec<Waker>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        WaitQueue {
            generation: Cell::new(0),
            wakers: RefCell::new(Vec::new()),
        }
    }

    /// Park until the next [`WaitQueue::wake_all`]. Not cancellable; for
    /// continuation contexts use [`Coro::wait_on`].
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            queue: self,
            entered: self.generation.get(),
        }
    }

    /// Wake every parked waiter.
    pub fn wake_all(&self) {
        self.generation.set(self.generation.get() + 1);
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}

pub struct Wait<'a> {
    queue: &'a WaitQueue,
    entered: u64,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.queue.generation.get() != self.entered {
            Poll::Ready(())
        } else {
            self.queue.wakers.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// A kill hook. `kill` fires it; the owning continuation notices at its
/// next suspension point.
pub struct Cancellation {
    flag: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Cancellation {
            flag: Cell::new(false),
            waker: RefCell::new(None),
        }
    }

    /// Fire the hook. Idempotent; the first firing wakes the owner if it is
    /// parked.
    pub fn cancel(&self) {
        self.flag.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }
}

/// Per-continuation context: the cancellation token threaded through every
/// operation that can suspend.
pub struct Coro {
    cancel: Rc<Cancellation>,
}

impl Coro {
    pub fn new(cancel: Rc<Cancellation>) -> Self {
        Coro { cancel }
    }

    /// A context whose token never fires. For subsystem-internal work that
    /// no process kill should interrupt.
    pub fn detached() -> Self {
        Coro {
            cancel: Rc::new(Cancellation::new()),
        }
    }

    pub fn killed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`KernelError::Interrupted`] if the owning process is being
    /// killed. Called after every resumption.
    pub fn check(&self) -> Result<(), KernelError> {
        if self.killed() {
            Err(KernelError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Park on `queue` until it wakes, or until this continuation is
    /// killed.
    pub fn wait_on<'a>(&'a self, queue: &'a WaitQueue) -> CancellableWait<'a> {
        CancellableWait {
            coro: self,
            queue,
            entered: queue.generation.get(),
        }
    }
}

pub struct CancellableWait<'a> {
    coro: &'a Coro,
    queue: &'a WaitQueue,
    entered: u64,
}

impl Future for CancellableWait<'_> {
    type Output = Result<(), KernelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.coro.cancel.is_cancelled() {
            return Poll::Ready(Err(KernelError::Interrupted));
        }
        if self.queue.generation.get() != self.entered {
            return Poll::Ready(Ok(()));
        }
        self.queue.wakers.borrow_mut().push(cx.waker().clone());
        *self.coro.cancel.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}
