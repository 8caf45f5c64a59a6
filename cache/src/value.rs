// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    alloc::{alloc, dealloc, Layout},
    mem,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicU32, Ordering},
    thread,
};

use crate::error::Error;

/// Header of a cached record.
///
/// A record is a single heap allocation: this header, immediately followed by
/// the key bytes, immediately followed by the value bytes. The payload is
/// immutable after construction; only the reference count ever changes. A
/// record may be freed once it has left its bucket *and* no [`Finding`] holds
/// a reference any more.
#[repr(C)]
pub struct CachedValue {
    refs: AtomicU32,
    key_size: u32,
    value_size: u32,
}

const HEADER_SIZE: usize = mem::size_of::<CachedValue>();

impl CachedValue {
    pub(crate) fn construct(key: &[u8], value: &[u8]) -> Option<NonNull<CachedValue>> {
        if key.is_empty() || key.len() > u32::MAX as usize || value.len() > u32::MAX as usize
        {
            return None;
        }

        let layout = Self::layout(key.len(), value.len())?;
        let raw = unsafe { alloc(layout) } as *mut CachedValue;
        let header = NonNull::new(raw)?;

        unsafe {
            ptr::write(
                raw,
                CachedValue {
                    refs: AtomicU32::new(0),
                    key_size: key.len() as u32,
                    value_size: value.len() as u32,
                },
            );
            let data = (raw as *mut u8).add(HEADER_SIZE);
            ptr::copy_nonoverlapping(key.as_ptr(), data, key.len());
            ptr::copy_nonoverlapping(value.as_ptr(), data.add(key.len()), value.len());
        }

        Some(header)
    }

    fn layout(key_size: usize, value_size: usize) -> Option<Layout> {
        let size = HEADER_SIZE.checked_add(key_size)?.checked_add(value_size)?;
        Layout::from_size_align(size, mem::align_of::<CachedValue>()).ok()
    }

    pub fn key(&self) -> &[u8] {
        unsafe {
            let data = (self as *const CachedValue as *const u8).add(HEADER_SIZE);
            slice::from_raw_parts(data, self.key_size as usize)
        }
    }

    pub fn value(&self) -> &[u8] {
        unsafe {
            let data = (self as *const CachedValue as *const u8)
                .add(HEADER_SIZE + self.key_size as usize);
            slice::from_raw_parts(data, self.value_size as usize)
        }
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Total size of the allocation, the unit of all usage accounting.
    pub fn size(&self) -> u64 {
        (HEADER_SIZE + self.key_size as usize + self.value_size as usize) as u64
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    pub(crate) fn is_freeable(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0
    }

    /// # Safety
    ///
    /// `raw` must originate from [`CachedValue::construct`], the reference
    /// count must be zero, and no bucket or handle may still point at it.
    pub(crate) unsafe fn free(raw: *mut CachedValue) {
        debug_assert!(!raw.is_null());
        let layout = Self::layout((*raw).key_size as usize, (*raw).value_size as usize)
            .expect("layout was valid at construction");
        dealloc(raw as *mut u8, layout);
    }
}

/// Free a value that has left its bucket, waiting out any readers.
///
/// Readers hold the value only for the duration of a [`Finding`], which is
/// expected to be short lived; yielding is cheaper than parking here.
pub(crate) fn free_value(raw: *mut CachedValue) {
    debug_assert!(!raw.is_null());
    unsafe {
        while !(*raw).is_freeable() {
            thread::yield_now();
        }
        CachedValue::free(raw);
    }
}

/// An owned, not-yet-inserted cache record.
///
/// Produced by [`Value::new`] and consumed by `Cache::insert`. If insertion
/// fails (or the value is simply dropped) the allocation is released here;
/// on success ownership passes to the bucket.
pub struct Value {
    ptr: NonNull<CachedValue>,
}

unsafe impl Send for Value {}

impl Value {
    pub fn new(key: &[u8], value: &[u8]) -> Result<Self, Error> {
        CachedValue::construct(key, value)
            .map(|ptr| Value { ptr })
            .ok_or(Error::OutOfMemory)
    }

    pub fn key(&self) -> &[u8] {
        unsafe { self.ptr.as_ref() }.key()
    }

    pub fn value(&self) -> &[u8] {
        unsafe { self.ptr.as_ref() }.value()
    }

    pub fn size(&self) -> u64 {
        unsafe { self.ptr.as_ref() }.size()
    }

    pub(crate) fn into_raw(self) -> *mut CachedValue {
        let raw = self.ptr.as_ptr();
        mem::forget(self);
        raw
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        // never shared: the refcount is still zero
        unsafe { CachedValue::free(self.ptr.as_ptr()) }
    }
}

/// A refcounted read handle returned by `Cache::find`.
///
/// Holding a `Finding` keeps the underlying record alive even if it is
/// concurrently evicted from its bucket; dropping the handle releases the
/// reference. The handle never blocks on drop.
pub struct Finding {
    value: Option<NonNull<CachedValue>>,
    result: Result<(), Error>,
}

unsafe impl Send for Finding {}
unsafe impl Sync for Finding {}

impl Finding {
    pub(crate) fn hit(value: NonNull<CachedValue>) -> Self {
        unsafe { value.as_ref() }.acquire();
        Self {
            value: Some(value),
            result: Ok(()),
        }
    }

    pub(crate) fn miss(error: Error) -> Self {
        Self {
            value: None,
            result: Err(error),
        }
    }

    pub fn found(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&CachedValue> {
        self.value.as_ref().map(|v| unsafe { v.as_ref() })
    }

    /// `Ok(())` on a hit, otherwise the reason for the miss
    /// ([`Error::NotFound`], [`Error::Busy`], [`Error::ShuttingDown`]).
    pub fn result(&self) -> Result<(), Error> {
        self.result
    }
}

impl Drop for Finding {
    fn drop(&mut self) {
        if let Some(value) = self.value {
            unsafe { value.as_ref() }.release();
        }
    }
}
