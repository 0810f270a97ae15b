use std::marker::PhantomData;
use std::ops::Range;

/// Unchecked shared access to the elements of a mutable slice.
#[derive(Debug)]
pub struct ParallelSliceAccess<'a, T> {
    ptr: *mut T,
    len: usize,
    marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> Clone for ParallelSliceAccess<'a, T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            len: self.len,
            marker: PhantomData,
        }
    }
}

unsafe impl<'a, T: Sync> Sync for ParallelSliceAccess<'a, T> {}
unsafe impl<'a, T: Send> Send for ParallelSliceAccess<'a, T> {}

impl<'a, T> ParallelSliceAccess<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Construct a shared subslice for the given range.
    ///
    /// Panics if the range is out of bounds.
    ///
    /// # Safety
    ///
    /// No thread may hold a mutable subslice overlapping the range at the same time.
    pub unsafe fn subslice(&self, range: Range<usize>) -> &'a [T] {
        let Range { start, end } = range;
        assert!(start <= end && end <= self.len, "Subslice range out of bounds.");
        std::slice::from_raw_parts(self.ptr.add(start), end - start)
    }

    /// Construct a mutable subslice for the given range.
    ///
    /// Panics if the range is out of bounds.
    ///
    /// # Safety
    ///
    /// Multiple threads must not hold overlapping subslices at the same time.
    pub unsafe fn subslice_mut(&self, range: Range<usize>) -> &'a mut [T] {
        let Range { start, end } = range;
        assert!(start <= end && end <= self.len, "Subslice range out of bounds.");
        std::slice::from_raw_parts_mut(self.ptr.add(start), end - start)
    }
}
