//! Linear memory instances.
//!
//! A memory is a contiguous, mutable array of raw bytes growable in 64 KiB
//! pages. Shared memories additionally serialize `grow` and atomic
//! read-modify-write operations behind a per-memory mutex and carry the
//! wait/notify queues of the threads proposal.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memory_units::{Bytes, Pages, RoundUpTo};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, TrapCode};
use crate::types::{Limits, MemoryType};
use crate::value::LittleEndianConvert;

/// Size of one page of linear memory: 64 KiB.
pub const LINEAR_MEMORY_PAGE_SIZE: Bytes = Bytes(65536);

/// Maximal number of pages: 4 GiB of addressable memory.
const LINEAR_MEMORY_MAX_PAGES: Pages = Pages(65536);

/// How long a waiter sleeps between cancellation checks.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Reference to a [`MemoryInstance`] with shared ownership semantics.
#[derive(Clone)]
pub struct MemoryRef(Arc<MemoryInstance>);

impl core::ops::Deref for MemoryRef {
    type Target = MemoryInstance;
    fn deref(&self) -> &MemoryInstance {
        &self.0
    }
}

impl fmt::Debug for MemoryRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct WaitState {
    waiting: u32,
    wake_budget: u32,
}

#[derive(Default)]
struct WaitSlot {
    state: Mutex<WaitState>,
    condvar: Condvar,
}

/// Runtime representation of a linear memory.
pub struct MemoryInstance {
    ty: MemoryType,
    buffer: RwLock<Vec<u8>>,
    /// Engine-wide grow ceiling in pages, taken from the configuration.
    page_limit: u32,
    /// Serializes `grow` and atomic RMW sequences on shared memories.
    atomic_lock: Mutex<()>,
    /// Waiter queues keyed by byte address.
    waiters: Mutex<HashMap<u64, Arc<WaitSlot>>>,
}

impl fmt::Debug for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryInstance")
            .field("ty", &self.ty)
            .field("buffer.len", &self.buffer.read().len())
            .finish()
    }
}

impl MemoryInstance {
    /// Allocates a memory instance.
    ///
    /// Allocated memory is zeroed. `page_limit` is the configured
    /// `max_memory_page` ceiling; growth never exceeds it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the limits are inconsistent, exceed the 4 GiB
    /// address space, or if a shared memory lacks a maximum.
    pub fn alloc(ty: MemoryType, page_limit: u32) -> Result<MemoryRef, Error> {
        ty.limits.validate()?;
        if ty.limits.min as usize > LINEAR_MEMORY_MAX_PAGES.0
            || ty.limits.max.unwrap_or(0) as usize > LINEAR_MEMORY_MAX_PAGES.0
        {
            return Err(Error::Memory(format!(
                "memory limits {:?} exceed the addressable maximum of {} pages",
                ty.limits, LINEAR_MEMORY_MAX_PAGES.0
            )));
        }
        if ty.shared && ty.limits.max.is_none() {
            return Err(Error::Memory(
                "shared memories require a declared maximum".into(),
            ));
        }
        let initial: Bytes = Pages(ty.limits.min as usize).into();
        Ok(MemoryRef(Arc::new(MemoryInstance {
            ty,
            buffer: RwLock::new(vec![0u8; initial.0]),
            page_limit,
            atomic_lock: Mutex::new(()),
            waiters: Mutex::new(HashMap::new()),
        })))
    }

    /// The memory type.
    pub fn ty(&self) -> &MemoryType {
        &self.ty
    }

    /// The declared limits.
    pub fn limits(&self) -> &Limits {
        &self.ty.limits
    }

    /// Whether the memory is shared between threads.
    pub fn is_shared(&self) -> bool {
        self.ty.shared
    }

    /// Current size in pages.
    pub fn current_pages(&self) -> u32 {
        let pages: Pages = Bytes(self.buffer.read().len()).round_up_to();
        pages.0 as u32
    }

    /// Current size in bytes.
    pub fn byte_len(&self) -> usize {
        self.buffer.read().len()
    }

    /// Grows the memory by `delta` pages.
    ///
    /// Returns the old size in pages, or `u32::MAX` (`-1`) unchanged when
    /// the new size would exceed the declared maximum or the configured
    /// ceiling. For shared memories growth is atomic with respect to
    /// concurrent readers: they observe either the old or the new size.
    pub fn grow(&self, delta: u32) -> u32 {
        let _serialized = self.atomic_lock.lock();
        let mut buffer = self.buffer.write();
        let old_pages: Pages = Bytes(buffer.len()).round_up_to();
        let old_pages = old_pages.0 as u32;
        let ceiling = self
            .ty
            .limits
            .max
            .unwrap_or(LINEAR_MEMORY_MAX_PAGES.0 as u32)
            .min(self.page_limit);
        let new_pages = match old_pages.checked_add(delta) {
            Some(total) if total <= ceiling => total,
            _ => return u32::MAX,
        };
        let new_bytes: Bytes = Pages(new_pages as usize).into();
        buffer.resize(new_bytes.0, 0);
        old_pages
    }

    fn checked_range(len: usize, offset: u64, size: usize) -> Result<Range<usize>, TrapCode> {
        // Unsigned arithmetic; overflow is out of bounds by definition.
        let end = offset
            .checked_add(size as u64)
            .ok_or(TrapCode::MemoryOutOfBounds)?;
        if end > len as u64 {
            return Err(TrapCode::MemoryOutOfBounds);
        }
        Ok(offset as usize..end as usize)
    }

    /// Reads a value at `offset`.
    pub fn get_value<T: LittleEndianConvert>(&self, offset: u64) -> Result<T, TrapCode> {
        let buffer = self.buffer.read();
        let range = Self::checked_range(buffer.len(), offset, core::mem::size_of::<T>())?;
        Ok(T::from_little_endian(&buffer[range]))
    }

    /// Writes a value at `offset`.
    pub fn set_value<T: LittleEndianConvert>(&self, offset: u64, value: T) -> Result<(), TrapCode> {
        let mut buffer = self.buffer.write();
        let range = Self::checked_range(buffer.len(), offset, core::mem::size_of::<T>())?;
        value.into_little_endian(&mut buffer[range]);
        Ok(())
    }

    /// Copies bytes from `offset` into `target`.
    pub fn get_into(&self, offset: u64, target: &mut [u8]) -> Result<(), TrapCode> {
        let buffer = self.buffer.read();
        let range = Self::checked_range(buffer.len(), offset, target.len())?;
        target.copy_from_slice(&buffer[range]);
        Ok(())
    }

    /// Copies `value` into memory at `offset`.
    pub fn set(&self, offset: u64, value: &[u8]) -> Result<(), TrapCode> {
        let mut buffer = self.buffer.write();
        let range = Self::checked_range(buffer.len(), offset, value.len())?;
        buffer[range].copy_from_slice(value);
        Ok(())
    }

    /// `memory.fill`: writes `len` copies of `byte` at `offset`.
    pub fn fill(&self, offset: u64, byte: u8, len: u64) -> Result<(), TrapCode> {
        let mut buffer = self.buffer.write();
        let range = Self::checked_range(buffer.len(), offset, len as usize)?;
        buffer[range].fill(byte);
        Ok(())
    }

    /// `memory.copy` within one memory; overlapping regions behave like
    /// `memmove`.
    pub fn copy_within(&self, dst: u64, src: u64, len: u64) -> Result<(), TrapCode> {
        let mut buffer = self.buffer.write();
        let src_range = Self::checked_range(buffer.len(), src, len as usize)?;
        Self::checked_range(buffer.len(), dst, len as usize)?;
        buffer.copy_within(src_range, dst as usize);
        Ok(())
    }

    /// `memory.copy` between two distinct memories.
    pub fn copy_between(
        dst_mem: &MemoryInstance,
        src_mem: &MemoryInstance,
        dst: u64,
        src: u64,
        len: u64,
    ) -> Result<(), TrapCode> {
        let mut scratch = vec![0u8; len as usize];
        src_mem.get_into(src, &mut scratch)?;
        dst_mem.set(dst, &scratch)
    }

    /// Aligned atomic load; sequentially consistent via the per-memory lock.
    pub fn atomic_load<T: LittleEndianConvert>(&self, offset: u64) -> Result<T, TrapCode> {
        Self::check_alignment::<T>(offset)?;
        let _serialized = self.atomic_lock.lock();
        self.get_value(offset)
    }

    /// Aligned atomic store.
    pub fn atomic_store<T: LittleEndianConvert>(
        &self,
        offset: u64,
        value: T,
    ) -> Result<(), TrapCode> {
        Self::check_alignment::<T>(offset)?;
        let _serialized = self.atomic_lock.lock();
        self.set_value(offset, value)
    }

    /// Aligned atomic read-modify-write; returns the old value.
    pub fn atomic_rmw<T, F>(&self, offset: u64, op: F) -> Result<T, TrapCode>
    where
        T: LittleEndianConvert + Copy,
        F: FnOnce(T) -> T,
    {
        Self::check_alignment::<T>(offset)?;
        let _serialized = self.atomic_lock.lock();
        let old: T = self.get_value(offset)?;
        self.set_value(offset, op(old))?;
        Ok(old)
    }

    /// Aligned atomic compare-exchange; returns the old value.
    pub fn atomic_cmpxchg<T>(&self, offset: u64, expected: T, new: T) -> Result<T, TrapCode>
    where
        T: LittleEndianConvert + Copy + PartialEq,
    {
        Self::check_alignment::<T>(offset)?;
        let _serialized = self.atomic_lock.lock();
        let old: T = self.get_value(offset)?;
        if old == expected {
            self.set_value(offset, new)?;
        }
        Ok(old)
    }

    fn check_alignment<T>(offset: u64) -> Result<(), TrapCode> {
        if offset % core::mem::size_of::<T>() as u64 != 0 {
            return Err(TrapCode::MemoryOutOfBounds);
        }
        Ok(())
    }

    fn wait_slot(&self, addr: u64) -> Arc<WaitSlot> {
        Arc::clone(
            self.waiters
                .lock()
                .entry(addr)
                .or_insert_with(|| Arc::new(WaitSlot::default())),
        )
    }

    /// `memory.atomic.wait32` / `wait64` over a generic word type.
    ///
    /// Returns `0` when woken, `1` when the loaded value differs from
    /// `expected`, `2` on timeout. `timeout_ns < 0` waits forever. The
    /// cancellation flag is observed while blocked and unwinds with
    /// [`TrapCode::Interrupted`].
    pub fn wait<T>(
        &self,
        addr: u64,
        expected: T,
        timeout_ns: i64,
        cancel: &AtomicBool,
    ) -> Result<u32, TrapCode>
    where
        T: LittleEndianConvert + Copy + PartialEq,
    {
        if !self.ty.shared {
            return Err(TrapCode::IllegalOpCode);
        }
        Self::check_alignment::<T>(addr)?;
        let slot = self.wait_slot(addr);
        let deadline = if timeout_ns >= 0 {
            Some(Instant::now() + Duration::from_nanos(timeout_ns as u64))
        } else {
            None
        };

        let mut state = slot.state.lock();
        // The value check happens under the waiter lock so a concurrent
        // store+notify cannot slip between check and sleep.
        let current: T = {
            let _serialized = self.atomic_lock.lock();
            self.get_value(addr)?
        };
        if current != expected {
            return Ok(1);
        }
        state.waiting += 1;
        loop {
            if cancel.load(Ordering::Relaxed) {
                state.waiting -= 1;
                return Err(TrapCode::Interrupted);
            }
            if state.wake_budget > 0 {
                state.wake_budget -= 1;
                state.waiting -= 1;
                return Ok(0);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiting -= 1;
                        return Ok(2);
                    }
                    WAIT_SLICE.min(deadline - now)
                }
                None => WAIT_SLICE,
            };
            slot.condvar.wait_for(&mut state, slice);
        }
    }

    /// `memory.atomic.notify`: wakes up to `count` waiters at `addr` and
    /// returns how many were woken.
    pub fn notify(&self, addr: u64, count: u32) -> Result<u32, TrapCode> {
        if !self.ty.shared {
            // Notifying an unshared memory is valid and wakes nobody.
            return Ok(0);
        }
        Self::check_alignment::<u32>(addr)?;
        let slot = self.wait_slot(addr);
        let mut state = slot.state.lock();
        let woken = count.min(state.waiting.saturating_sub(state.wake_budget));
        state.wake_budget += woken;
        slot.condvar.notify_all();
        Ok(woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn plain(min: u32, max: Option<u32>) -> MemoryRef {
        MemoryInstance::alloc(
            MemoryType {
                limits: Limits::new(min, max),
                shared: false,
            },
            65536,
        )
        .unwrap()
    }

    #[test]
    fn grow_respects_declared_maximum() {
        let memory = plain(1, Some(2));
        assert_eq!(memory.grow(1), 1);
        assert_eq!(memory.grow(1), u32::MAX);
        assert_eq!(memory.current_pages(), 2);
    }

    #[test]
    fn grow_respects_configured_ceiling() {
        let memory = MemoryInstance::alloc(
            MemoryType {
                limits: Limits::new(1, None),
                shared: false,
            },
            3,
        )
        .unwrap();
        assert_eq!(memory.grow(2), 1);
        assert_eq!(memory.grow(1), u32::MAX);
    }

    #[test]
    fn bounds_check_is_unsigned_and_overflow_safe() {
        let memory = plain(1, None);
        assert!(memory.get_value::<u32>(65532).is_ok());
        assert!(matches!(
            memory.get_value::<u32>(65533),
            Err(TrapCode::MemoryOutOfBounds)
        ));
        assert!(matches!(
            memory.get_value::<u32>(u64::MAX - 1),
            Err(TrapCode::MemoryOutOfBounds)
        ));
    }

    #[test]
    fn values_round_trip() {
        let memory = plain(1, None);
        memory.set_value::<u64>(8, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(memory.get_value::<u64>(8).unwrap(), 0xdead_beef_cafe_f00d);
        // Little endian byte order.
        assert_eq!(memory.get_value::<u8>(8).unwrap(), 0x0d);
    }

    #[test]
    fn copy_within_handles_overlap() {
        let memory = plain(1, None);
        memory.set(0, &[1, 2, 3, 4]).unwrap();
        memory.copy_within(1, 0, 4).unwrap();
        let mut out = [0u8; 5];
        memory.get_into(0, &mut out).unwrap();
        assert_eq!(out, [1, 1, 2, 3, 4]);
    }

    #[test]
    fn wait_on_unshared_memory_traps() {
        let memory = plain(1, None);
        let cancel = AtomicBool::new(false);
        assert!(matches!(
            memory.wait::<u32>(0, 0, 0, &cancel),
            Err(TrapCode::IllegalOpCode)
        ));
    }

    #[test]
    fn wait_not_equal_returns_immediately() {
        let memory = MemoryInstance::alloc(
            MemoryType {
                limits: Limits::new(1, Some(1)),
                shared: true,
            },
            65536,
        )
        .unwrap();
        memory.set_value::<u32>(0, 7).unwrap();
        let cancel = AtomicBool::new(false);
        assert_eq!(memory.wait::<u32>(0, 0, -1, &cancel).unwrap(), 1);
    }

    #[test]
    fn notify_wakes_waiters() {
        let memory = MemoryInstance::alloc(
            MemoryType {
                limits: Limits::new(1, Some(1)),
                shared: true,
            },
            65536,
        )
        .unwrap();
        let waiter = {
            let memory = memory.clone();
            thread::spawn(move || {
                let cancel = AtomicBool::new(false);
                memory.wait::<u32>(0, 0, -1, &cancel)
            })
        };
        // Wait until the waiter parked, then wake it.
        loop {
            thread::sleep(Duration::from_millis(5));
            if memory.notify(0, 1).unwrap() == 1 {
                break;
            }
        }
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }
}
