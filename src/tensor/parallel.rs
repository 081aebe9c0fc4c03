use std::marker::PhantomData;

/// Work (elements times weight) below which a kernel runs on the calling thread.
pub(crate) const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Chooses a thread count for a kernel touching `elements` values at `weight` cost each.
///
/// Small layers or batches run single threaded, large ones fan out up to the pool size.
pub fn get_threads(elements: usize, weight: usize) -> usize {
    let work = elements.saturating_mul(weight.max(1));
    (work / PARALLEL_THRESHOLD).clamp(1, rayon::current_num_threads())
}

pub(crate) fn broadcast(threads: Option<usize>, f: impl Fn(usize, usize) + Send + Sync) {
    let threads = threads
        .unwrap_or(usize::MAX)
        .min(rayon::current_num_threads())
        .max(1);
    if threads == 1 {
        f(0, 1);
    } else {
        rayon::in_place_scope(|scope| {
            scope.spawn_broadcast(|_scope, context| {
                let thread_id = context.index();
                debug_assert!(threads <= context.num_threads());
                if thread_id < threads {
                    f(thread_id, threads);
                }
            });
        });
    }
}

/// Runs `f(i)` for `i` in `0..count`, striding the items over `threads` workers.
pub(crate) fn for_i(count: usize, threads: usize, f: impl Fn(usize) + Send + Sync) {
    let threads = threads.min(count).max(1);
    broadcast(Some(threads), |thread_id, threads| {
        (thread_id..count).step_by(threads).for_each(&f);
    });
}

/// A mutable slice that can be shared between the workers of [`for_i`].
///
/// Each worker must only touch elements no other worker touches.
#[derive(Clone, Copy)]
pub(crate) struct SyncSliceMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _m: PhantomData<&'a mut [T]>,
}

impl<'a, T> SyncSliceMut<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _m: PhantomData,
        }
    }
    pub(crate) fn len(&self) -> usize {
        self.len
    }
    /// # Safety
    /// No other reference to `start..start + len` may be alive.
    pub(crate) unsafe fn slice_mut(&self, start: usize, len: usize) -> &'a mut [T] {
        assert!(start + len <= self.len, "{start} + {len} > {}", self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), len) }
    }
    /// # Safety
    /// No other reference to element `index` may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self, index: usize) -> &'a mut T {
        assert!(index < self.len, "{index} >= {}", self.len);
        unsafe { &mut *self.ptr.add(index) }
    }
}

unsafe impl<T: Send> Send for SyncSliceMut<'_, T> {}
unsafe impl<T: Send> Sync for SyncSliceMut<'_, T> {}
