#![allow(dead_code)]

use parking_lot::Mutex;
use rustix::io;
use spindle::{Runtime, StartDescriptor};
use spindle::kernel::{Exit, Kernel, KernelHandle, Launch, PthreadKernel};
use spindle::memory::{MmapMemory, Region, VirtualMemory};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

/// A `VirtualMemory` that tracks every page it hands out, so that tests can
/// check that thread memory is released exactly once.
#[derive(Default)]
pub struct TrackingMemory {
    inner: MmapMemory,
    state: Mutex<Tracking>,
    fail_reserve: AtomicBool,
    double_frees: AtomicUsize,
}

#[derive(Default)]
struct Tracking {
    // Page address to the base of the reservation it came from.
    pages: BTreeMap<usize, usize>,
    bases: BTreeSet<usize>,
    reservations: usize,
}

impl TrackingMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The number of pages reserved and not yet released.
    pub fn live_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// The number of reservations made so far.
    pub fn reservations(&self) -> usize {
        self.state.lock().reservations
    }

    /// Test whether `addr` is the base of a reservation we made.
    pub fn is_reservation_base(&self, addr: usize) -> bool {
        self.state.lock().bases.contains(&addr)
    }

    /// Test whether `addr` is on a page that is currently reserved.
    pub fn is_live(&self, addr: usize) -> bool {
        let page = addr & !(self.page_size() - 1);
        self.state.lock().pages.contains_key(&page)
    }

    pub fn double_frees(&self) -> usize {
        self.double_frees.load(SeqCst)
    }

    /// Make every subsequent reservation fail with `ENOMEM`.
    pub fn fail_reservations(&self, fail: bool) {
        self.fail_reserve.store(fail, SeqCst);
    }
}

impl VirtualMemory for TrackingMemory {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn reserve(&self, size: usize) -> io::Result<Region> {
        if self.fail_reserve.load(SeqCst) {
            return Err(io::Errno::NOMEM);
        }
        let region = self.inner.reserve(size)?;
        let mut state = self.state.lock();
        for page in (region.addr()..region.end()).step_by(self.page_size()) {
            state.pages.insert(page, region.addr());
        }
        state.bases.insert(region.addr());
        state.reservations += 1;
        Ok(region)
    }

    unsafe fn commit(&self, region: Region) -> io::Result<()> {
        unsafe { self.inner.commit(region) }
    }

    unsafe fn release(&self, region: Region) -> io::Result<()> {
        let mut state = self.state.lock();
        let pages: Vec<usize> = (region.addr()..region.end())
            .step_by(self.page_size())
            .collect();
        if pages.iter().any(|page| !state.pages.contains_key(page)) {
            // Don't unmap anything; part of the region may have been reused
            // by a later reservation.
            self.double_frees.fetch_add(1, SeqCst);
            return Ok(());
        }
        for page in pages {
            state.pages.remove(&page);
        }
        drop(state);
        unsafe { self.inner.release(region) }
    }
}

/// A `Kernel` that runs threads with pthreads, but can be told to refuse to
/// create threads, and records requests to exit the process instead of
/// exiting.
pub struct TestKernel {
    inner: PthreadKernel,
    fail_create: AtomicBool,
    creates: AtomicUsize,
    terminates: AtomicUsize,
    starts: Mutex<Vec<StartDescriptor>>,
    exits: Mutex<Vec<i32>>,
}

impl TestKernel {
    pub fn new(memory: Arc<dyn VirtualMemory>) -> Arc<Self> {
        Arc::new(Self {
            inner: PthreadKernel::new(memory).unwrap(),
            fail_create: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            exits: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(SeqCst)
    }

    /// The start descriptors of every launch requested so far.
    pub fn starts(&self) -> Vec<StartDescriptor> {
        self.starts.lock().clone()
    }

    pub fn exits(&self) -> Vec<i32> {
        self.exits.lock().clone()
    }
}

impl Kernel for TestKernel {
    fn create_thread(&self, launch: Launch) -> io::Result<KernelHandle> {
        self.creates.fetch_add(1, SeqCst);
        self.starts.lock().push(launch.start);
        if self.fail_create.load(SeqCst) {
            return Err(io::Errno::AGAIN);
        }
        self.inner.create_thread(launch)
    }

    fn terminate_thread(&self, exit: Exit) {
        self.terminates.fetch_add(1, SeqCst);
        self.inner.terminate_thread(exit)
    }

    fn current_handle(&self) -> KernelHandle {
        self.inner.current_handle()
    }

    fn exit_process(&self, status: i32) {
        self.exits.lock().push(status);
    }

    unsafe fn after_fork_child(&self) {
        unsafe { self.inner.after_fork_child() }
    }
}

/// Everything a test needs: a runtime that adopted the test's thread as its
/// main thread, plus the doubles behind it.
pub struct Fixture {
    pub runtime: Arc<Runtime>,
    pub memory: Arc<TrackingMemory>,
    pub kernel: Arc<TestKernel>,
}

impl Fixture {
    pub fn new() -> Self {
        let memory = TrackingMemory::new();
        let kernel = TestKernel::new(memory.clone());
        let runtime = Arc::new(Runtime::new(memory.clone(), kernel.clone()).unwrap());
        Self {
            runtime,
            memory,
            kernel,
        }
    }

    /// A runtime that didn't adopt the calling thread, so that the process
    /// "exits" as soon as the created threads are done.
    pub fn without_main_thread() -> Self {
        let memory = TrackingMemory::new();
        let kernel = TestKernel::new(memory.clone());
        let runtime = Arc::new(Runtime::without_main_thread(
            memory.clone(),
            kernel.clone(),
        ));
        Self {
            runtime,
            memory,
            kernel,
        }
    }
}
