use std::fmt::{Debug, Formatter};
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use nohash_hasher::IntMap;
use tracing::trace;

use crate::error::*;
use crate::instruction::RmwOp;

pub const PAGE_SIZE: u64 = 65536;
pub const MAX_PAGES: u32 = 65536;

pub const WAIT_OK: u32 = 0;
pub const WAIT_NOT_EQUAL: u32 = 1;
pub const WAIT_TIMED_OUT: u32 = 2;

const WORDS_PER_PAGE: u64 = PAGE_SIZE / 8;
const PAGES_PER_BLOCK: usize = 256;
// Waiters with an interrupt flag re-check it at least this often.
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

type Page = Box<[AtomicU64]>;
type PageBlock = Box<[OnceLock<Page>]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub initial: u32,
    pub maximum: u32,
    pub shared: bool,
}

impl MemoryLimits {
    pub fn new(initial: u32, maximum: Option<u32>) -> Self {
        Self { initial, maximum: maximum.unwrap_or(MAX_PAGES), shared: false }
    }

    pub fn shared(initial: u32, maximum: u32) -> Self {
        Self { initial, maximum, shared: true }
    }
}

#[derive(Default)]
struct WaitCounts {
    waiters: u32,
    pending: u32,
}

#[derive(Default)]
struct WaitState {
    counts: Mutex<WaitCounts>,
    wake: Condvar,
}

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

#[inline(always)]
fn mask(size: u64) -> u64 { if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 } }

#[cold]
fn out_of_bounds(addr: u64, limit: u64, size: u64) -> Error {
    Error::trap(format!(
        "{OOB_MEMORY_ACCESS}: attempted to access address: {addr} but limit is: {limit} and size: {size}"
    ))
}

/// Linear memory stored as a table of fixed 64 KiB slabs of atomic words.
///
/// Slabs are allocated once and never move, so accesses to existing pages need no
/// lock while another thread grows the memory. Growth is serialized by its own
/// mutex; waiters coordinate through one monitor per address.
pub struct Memory {
    limits: MemoryLimits,
    pages: AtomicU32,
    directory: Box<[OnceLock<PageBlock>]>,
    grow_lock: Mutex<()>,
    wait_states: Mutex<IntMap<u64, Arc<WaitState>>>,
}

impl Debug for Memory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("pages", &self.pages())
            .field("limits", &self.limits)
            .finish()
    }
}

macro_rules! impl_access {
    ($ty:ty, $size:literal, $read:ident, $write:ident) => {
        #[inline]
        pub fn $read(&self, addr: u64) -> Result<$ty, Error> { Ok(self.load_bits(addr, $size)? as $ty) }
        #[inline]
        pub fn $write(&self, addr: u64, v: $ty) -> Result<(), Error> { self.store_bits(addr, $size, v as u64) }
    };
}

impl Memory {
    /// Allocates the initial pages. Limits past 4 GiB or a maximum below the
    /// initial size are rejected with the decoder's messages.
    pub fn new(limits: MemoryLimits) -> Result<Self, Error> {
        let MemoryLimits { initial, maximum, .. } = limits;
        if initial > MAX_PAGES || maximum > MAX_PAGES {
            return Err(Error::malformed(MEMORY_SIZE_LIMIT));
        }
        if maximum < initial {
            return Err(Error::malformed(SIZE_MIN_GREATER_THAN_MAX));
        }
        let directory = (0..(MAX_PAGES as usize).div_ceil(PAGES_PER_BLOCK)).map(|_| OnceLock::new()).collect();
        let mem = Self {
            limits,
            pages: AtomicU32::new(0),
            directory,
            grow_lock: Mutex::new(()),
            wait_states: Mutex::new(IntMap::default()),
        };
        for p in 0..initial {
            mem.allocate_page(p);
        }
        mem.pages.store(initial, Ordering::Release);
        Ok(mem)
    }

    pub fn limits(&self) -> MemoryLimits { self.limits }
    pub fn is_shared(&self) -> bool { self.limits.shared }
    pub fn maximum(&self) -> u32 { self.limits.maximum }
    #[inline]
    pub fn pages(&self) -> u32 { self.pages.load(Ordering::Acquire) }
    #[inline]
    pub fn byte_len(&self) -> u64 { self.pages() as u64 * PAGE_SIZE }

    fn allocate_page(&self, p: u32) {
        let p = p as usize;
        let block = self.directory[p / PAGES_PER_BLOCK]
            .get_or_init(|| (0..PAGES_PER_BLOCK).map(|_| OnceLock::new()).collect());
        block[p % PAGES_PER_BLOCK].get_or_init(|| (0..WORDS_PER_PAGE).map(|_| AtomicU64::new(0)).collect());
    }

    #[inline(always)]
    fn word_at(&self, w: u64) -> Result<&AtomicU64, Error> {
        let page = (w / WORDS_PER_PAGE) as usize;
        self.directory
            .get(page / PAGES_PER_BLOCK)
            .and_then(OnceLock::get)
            .and_then(|block| block[page % PAGES_PER_BLOCK].get())
            .and_then(|words| words.get((w % WORDS_PER_PAGE) as usize))
            .ok_or_else(|| Error::trap(OOB_MEMORY_ACCESS))
    }

    #[inline(always)]
    pub fn check_bounds(&self, addr: u64, size: u64) -> Result<(), Error> {
        let limit = self.byte_len();
        match addr.checked_add(size) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(out_of_bounds(addr, limit, size)),
        }
    }

    /// Returns the previous page count, or `u32::MAX` when the result would exceed the maximum.
    pub fn grow(&self, delta: u32) -> u32 {
        let _guard = lock(&self.grow_lock);
        let old = self.pages.load(Ordering::Acquire);
        if delta == 0 { return old; }
        let new = old as u64 + delta as u64;
        if new > self.limits.maximum as u64 {
            trace!(old, delta, max = self.limits.maximum, "memory grow refused");
            return u32::MAX;
        }
        for p in old..new as u32 {
            self.allocate_page(p);
        }
        self.pages.store(new as u32, Ordering::Release);
        trace!(old, new, "memory grown");
        old
    }

    fn merge_word(&self, w: u64, mask: u64, bits: u64) -> Result<(), Error> {
        let word = self.word_at(w)?;
        if mask == u64::MAX {
            word.store(bits, Ordering::Relaxed);
        } else {
            let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| Some((old & !mask) | (bits & mask)));
        }
        Ok(())
    }

    /// Little-endian load of `size` (1..=8) bytes, zero-extended.
    #[inline]
    pub fn load_bits(&self, addr: u64, size: u64) -> Result<u64, Error> {
        self.check_bounds(addr, size)?;
        let shift = (addr % 8) * 8;
        let w = addr / 8;
        let mut bits = self.word_at(w)?.load(Ordering::Relaxed) >> shift;
        if shift + size * 8 > 64 {
            bits |= self.word_at(w + 1)?.load(Ordering::Relaxed) << (64 - shift);
        }
        Ok(bits & mask(size))
    }

    /// Little-endian store of the low `size` (1..=8) bytes of `value`.
    #[inline]
    pub fn store_bits(&self, addr: u64, size: u64, value: u64) -> Result<(), Error> {
        self.check_bounds(addr, size)?;
        let shift = (addr % 8) * 8;
        let w = addr / 8;
        let m = mask(size);
        let v = value & m;
        self.merge_word(w, m << shift, v << shift)?;
        if shift + size * 8 > 64 {
            let spill = 64 - shift;
            self.merge_word(w + 1, m >> spill, v >> spill)?;
        }
        Ok(())
    }

    impl_access!(u8, 1, read_u8, write_u8);
    impl_access!(i8, 1, read_i8, write_i8);
    impl_access!(u16, 2, read_u16, write_u16);
    impl_access!(i16, 2, read_i16, write_i16);
    impl_access!(u32, 4, read_u32, write_u32);
    impl_access!(i32, 4, read_i32, write_i32);
    impl_access!(u64, 8, read_u64, write_u64);
    impl_access!(i64, 8, read_i64, write_i64);

    #[inline]
    pub fn read_f32(&self, addr: u64) -> Result<f32, Error> { Ok(f32::from_bits(self.read_u32(addr)?)) }
    #[inline]
    pub fn write_f32(&self, addr: u64, v: f32) -> Result<(), Error> { self.write_u32(addr, v.to_bits()) }
    #[inline]
    pub fn read_f64(&self, addr: u64) -> Result<f64, Error> { Ok(f64::from_bits(self.read_u64(addr)?)) }
    #[inline]
    pub fn write_f64(&self, addr: u64, v: f64) -> Result<(), Error> { self.write_u64(addr, v.to_bits()) }

    pub fn read_v128(&self, addr: u64) -> Result<u128, Error> {
        self.check_bounds(addr, 16)?;
        let lo = self.load_bits(addr, 8)? as u128;
        let hi = self.load_bits(addr + 8, 8)? as u128;
        Ok((hi << 64) | lo)
    }

    pub fn write_v128(&self, addr: u64, v: u128) -> Result<(), Error> {
        self.check_bounds(addr, 16)?;
        self.store_bits(addr, 8, v as u64)?;
        self.store_bits(addr + 8, 8, (v >> 64) as u64)
    }

    pub fn read_bytes(&self, addr: u64, len: u64) -> Result<Vec<u8>, Error> {
        self.check_bounds(addr, len)?;
        let mut out = Vec::with_capacity(len as usize);
        let end = addr + len;
        let mut a = addr;
        while a < end {
            let bytes = self.word_at(a / 8)?.load(Ordering::Relaxed).to_le_bytes();
            let from = (a % 8) as usize;
            let take = (8 - from).min((end - a) as usize);
            out.extend_from_slice(&bytes[from..from + take]);
            a += take as u64;
        }
        Ok(out)
    }

    /// Writes `len` bytes starting at `addr`; `fill` produces each word-sized chunk
    /// given its offset from `addr`.
    fn write_chunks(&self, addr: u64, len: u64, mut fill: impl FnMut(&mut [u8], usize)) -> Result<(), Error> {
        self.check_bounds(addr, len)?;
        let end = addr + len;
        let mut a = addr;
        while a < end {
            let from = (a % 8) as usize;
            let take = (8 - from).min((end - a) as usize);
            let mut bytes = [0u8; 8];
            fill(&mut bytes[from..from + take], (a - addr) as usize);
            let m = mask(take as u64) << (from * 8);
            self.merge_word(a / 8, m, u64::from_le_bytes(bytes))?;
            a += take as u64;
        }
        Ok(())
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.write_chunks(addr, data.len() as u64, |dst, off| dst.copy_from_slice(&data[off..off + dst.len()]))
    }

    pub fn fill(&self, addr: u64, value: u8, len: u64) -> Result<(), Error> {
        self.write_chunks(addr, len, |dst, _| dst.fill(value))
    }

    /// Overlap-safe copy within this memory.
    pub fn copy(&self, dest: u64, src: u64, len: u64) -> Result<(), Error> {
        self.check_bounds(dest, len)?;
        let tmp = self.read_bytes(src, len)?;
        self.write(dest, &tmp)
    }

    /// Applies active data segments in order; the first one that does not fit
    /// aborts instantiation, leaving earlier segments written.
    pub fn initialize<'a>(&self, segments: impl IntoIterator<Item = (u64, &'a [u8])>) -> Result<(), Error> {
        for (offset, data) in segments {
            if let Err(e) = self.check_bounds(offset, data.len() as u64) {
                return Err(Error::uninstantiable(e.message()));
            }
            self.write(offset, data)?;
        }
        Ok(())
    }

    /// `memory.init`: copies `size` bytes of `segment` starting at `offset` to `dest`.
    pub fn init(&self, dest: u64, segment: &[u8], offset: u64, size: u64) -> Result<(), Error> {
        let end = offset.checked_add(size).filter(|&e| e <= segment.len() as u64);
        let Some(end) = end else {
            return Err(out_of_bounds(offset, segment.len() as u64, size));
        };
        self.check_bounds(dest, size)?;
        self.write(dest, &segment[offset as usize..end as usize])
    }

    pub fn zero(&self) {
        let len_words = self.byte_len() / 8;
        for w in 0..len_words {
            if let Ok(word) = self.word_at(w) {
                word.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn read_string(&self, addr: u64, len: u64) -> Result<String, Error> {
        String::from_utf8(self.read_bytes(addr, len)?).map_err(|_| Error::trap(INVALID_UTF8))
    }

    /// Reads a NUL-terminated UTF-8 string.
    pub fn read_cstring(&self, addr: u64) -> Result<String, Error> {
        let limit = self.byte_len();
        let mut end = addr;
        loop {
            if end >= limit { return Err(out_of_bounds(addr, limit, end - addr + 1)); }
            if self.read_u8(end)? == 0 { break; }
            end += 1;
        }
        self.read_string(addr, end - addr)
    }

    pub fn write_cstring(&self, addr: u64, s: &str) -> Result<(), Error> {
        self.check_bounds(addr, s.len() as u64 + 1)?;
        self.write(addr, s.as_bytes())?;
        self.write_u8(addr + s.len() as u64, 0)
    }

    // ---------------- Atomics ----------------

    #[inline]
    fn atomic_word(&self, addr: u64, size: u64) -> Result<(&AtomicU64, u64), Error> {
        self.check_bounds(addr, size)?;
        if addr % size != 0 { return Err(Error::trap(UNALIGNED_ATOMIC)); }
        Ok((self.word_at(addr / 8)?, (addr % 8) * 8))
    }

    /// Applies `f` to the `size`-byte value at `addr` atomically, returning the old value.
    fn atomic_update(&self, addr: u64, size: u64, f: impl Fn(u64) -> u64) -> Result<u64, Error> {
        let (word, shift) = self.atomic_word(addr, size)?;
        let m = mask(size);
        let mut cur = word.load(Ordering::SeqCst);
        loop {
            let old = (cur >> shift) & m;
            let next = (cur & !(m << shift)) | ((f(old) & m) << shift);
            match word.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(old),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn atomic_load(&self, addr: u64, size: u8) -> Result<u64, Error> {
        let (word, shift) = self.atomic_word(addr, size as u64)?;
        Ok((word.load(Ordering::SeqCst) >> shift) & mask(size as u64))
    }

    pub fn atomic_store(&self, addr: u64, size: u8, value: u64) -> Result<(), Error> {
        if size == 8 {
            let (word, _) = self.atomic_word(addr, 8)?;
            word.store(value, Ordering::SeqCst);
            return Ok(());
        }
        self.atomic_update(addr, size as u64, |_| value).map(|_| ())
    }

    pub fn atomic_rmw(&self, addr: u64, size: u8, op: RmwOp, value: u64) -> Result<u64, Error> {
        self.atomic_update(addr, size as u64, |old| match op {
            RmwOp::Add => old.wrapping_add(value),
            RmwOp::Sub => old.wrapping_sub(value),
            RmwOp::And => old & value,
            RmwOp::Or => old | value,
            RmwOp::Xor => old ^ value,
            RmwOp::Xchg => value,
        })
    }

    pub fn atomic_cmpxchg(&self, addr: u64, size: u8, expected: u64, replacement: u64) -> Result<u64, Error> {
        let expected = expected & mask(size as u64);
        self.atomic_update(addr, size as u64, |old| if old == expected { replacement } else { old })
    }

    pub fn atomic_add_i32(&self, addr: u64, v: i32) -> Result<i32, Error> {
        Ok(self.atomic_rmw(addr, 4, RmwOp::Add, v as u32 as u64)? as u32 as i32)
    }

    pub fn atomic_add_i64(&self, addr: u64, v: i64) -> Result<i64, Error> {
        Ok(self.atomic_rmw(addr, 8, RmwOp::Add, v as u64)? as i64)
    }

    pub fn atomic_fence(&self) { fence(Ordering::SeqCst); }

    fn wait_state(&self, addr: u64) -> Arc<WaitState> {
        Arc::clone(lock(&self.wait_states).entry(addr).or_default())
    }

    /// Drops the monitor for `addr` once no waiter or notifier holds it.
    fn release_wait_state(&self, addr: u64, state: Arc<WaitState>) {
        let mut states = lock(&self.wait_states);
        // every other holder clones and drops the Arc under this lock
        if Arc::strong_count(&state) == 2 {
            states.remove(&addr);
        }
        drop(state);
    }

    pub fn wait32(&self, addr: u64, expected: i32, timeout_ns: i64) -> Result<u32, Error> {
        self.wait_on(addr, 4, expected as u32 as u64, timeout_ns, None)
    }

    pub fn wait64(&self, addr: u64, expected: i64, timeout_ns: i64) -> Result<u32, Error> {
        self.wait_on(addr, 8, expected as u64, timeout_ns, None)
    }

    /// Blocks until notified, timed out (negative timeout waits forever) or interrupted.
    ///
    /// The value comparison happens under the address monitor, so a writer that
    /// stores and then notifies cannot slip between the check and the wait.
    pub fn wait_on(
        &self,
        addr: u64,
        size: u8,
        expected: u64,
        timeout_ns: i64,
        interrupt: Option<&AtomicBool>,
    ) -> Result<u32, Error> {
        self.atomic_word(addr, size as u64)?;
        if !self.limits.shared { return Err(Error::trap(EXPECTED_SHARED_MEMORY)); }

        let state = self.wait_state(addr);
        let result = self.wait_in(&state, addr, size, expected, timeout_ns, interrupt);
        self.release_wait_state(addr, state);
        result
    }

    fn wait_in(
        &self,
        state: &WaitState,
        addr: u64,
        size: u8,
        expected: u64,
        timeout_ns: i64,
        interrupt: Option<&AtomicBool>,
    ) -> Result<u32, Error> {
        let mut counts = lock(&state.counts);
        if self.atomic_load(addr, size)? != expected & mask(size as u64) {
            return Ok(WAIT_NOT_EQUAL);
        }
        let deadline = u64::try_from(timeout_ns).ok().map(|ns| Instant::now() + Duration::from_nanos(ns));
        counts.waiters += 1;
        loop {
            if counts.pending > 0 {
                counts.pending -= 1;
                counts.waiters -= 1;
                return Ok(WAIT_OK);
            }
            if interrupt.is_some_and(|flag| flag.swap(false, Ordering::AcqRel)) {
                counts.waiters -= 1;
                return Err(Error::Interrupted);
            }
            let mut slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        counts.waiters -= 1;
                        return Ok(WAIT_TIMED_OUT);
                    }
                    Some(d - now)
                }
                None => None,
            };
            if interrupt.is_some() {
                slice = Some(slice.map_or(INTERRUPT_POLL, |s| s.min(INTERRUPT_POLL)));
            }
            counts = match slice {
                Some(s) => state.wake.wait_timeout(counts, s).unwrap_or_else(PoisonError::into_inner).0,
                None => state.wake.wait(counts).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Wakes up to `count` waiters on `addr`; returns how many were woken.
    pub fn notify(&self, addr: u64, count: u32) -> Result<u32, Error> {
        self.atomic_word(addr, 4)?;
        if !self.limits.shared { return Ok(0); }
        let Some(state) = lock(&self.wait_states).get(&addr).cloned() else { return Ok(0) };
        let woken = {
            let mut counts = lock(&state.counts);
            let woken = count.min(counts.waiters - counts.pending);
            if woken > 0 {
                counts.pending += woken;
                state.wake.notify_all();
            }
            woken
        };
        self.release_wait_state(addr, state);
        Ok(woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn mem(pages: u32) -> Memory { Memory::new(MemoryLimits::new(pages, Some(4))).unwrap() }

    #[test]
    fn typed_roundtrip_across_word_and_page_edges() {
        let m = mem(2);
        m.write_i32(5, -123456).unwrap();
        assert_eq!(m.read_i32(5).unwrap(), -123456);
        m.write_u64(65532, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(m.read_u64(65532).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(m.read_u8(65532).unwrap(), 0x08);
        assert_eq!(m.read_u8(65536).unwrap(), 0x04);
        m.write_f64(13, -0.0).unwrap();
        assert_eq!(m.read_f64(13).unwrap().to_bits(), (-0.0f64).to_bits());
        m.write_i8(100, -1).unwrap();
        assert_eq!(m.read_u8(100).unwrap(), 0xff);
        assert_eq!(m.read_i16(100).unwrap(), 0x00ff);
        m.write_v128(200, u128::MAX - 1).unwrap();
        assert_eq!(m.read_v128(200).unwrap(), u128::MAX - 1);
    }

    #[test]
    fn neighbouring_bytes_are_preserved() {
        let m = mem(1);
        m.write_u64(0, u64::MAX).unwrap();
        m.write_u16(3, 0).unwrap();
        assert_eq!(m.read_u64(0).unwrap(), 0xffff_ff00_00ff_ffff);
    }

    #[test]
    fn bytes_roundtrip() {
        let m = mem(1);
        let data: Vec<u8> = (0..37).collect();
        m.write(3, &data).unwrap();
        assert_eq!(m.read_bytes(3, 37).unwrap(), data);
        assert_eq!(m.read_u8(2).unwrap(), 0);
        assert_eq!(m.read_u8(40).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_accesses_trap() {
        let m = mem(1);
        let err = m.read_i32(65533).unwrap_err();
        assert_eq!(
            err.message(),
            "out of bounds memory access: attempted to access address: 65533 but limit is: 65536 and size: 4"
        );
        assert!(m.read_u8(65536).is_err());
        assert!(m.read_bytes(u64::MAX, 2).is_err());
        assert!(m.write(65530, &[0; 7]).is_err());
        assert_eq!(m.read_bytes(65536, 0).unwrap(), Vec::<u8>::new());
        assert!(m.fill(65536, 1, 1).is_err());
        // a failed write leaves memory untouched
        assert_eq!(m.read_u32(65532).unwrap(), 0);
    }

    #[test]
    fn grow_reports_old_size_and_zero_fills() {
        let m = mem(1);
        m.write_u32(0, 7).unwrap();
        assert_eq!(m.grow(2), 1);
        assert_eq!(m.pages(), 3);
        assert_eq!(m.read_u32(0).unwrap(), 7);
        assert_eq!(m.read_u32(2 * 65536 + 100).unwrap(), 0);
        assert_eq!(m.grow(2), u32::MAX);
        assert_eq!(m.pages(), 3);
        assert_eq!(m.grow(0), 3);
        assert_eq!(m.grow(1), 3);
    }

    #[test]
    fn unbounded_memory_caps_at_max_pages() {
        let m = Memory::new(MemoryLimits::new(0, None)).unwrap();
        assert_eq!(m.maximum(), MAX_PAGES);
        assert_eq!(m.grow(MAX_PAGES + 1), u32::MAX);
        assert_eq!(m.grow(u32::MAX), u32::MAX);
    }

    #[test]
    fn copy_handles_overlap_both_ways() {
        let m = mem(1);
        m.write(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        m.copy(2, 0, 8).unwrap();
        assert_eq!(m.read_bytes(0, 10).unwrap(), vec![1, 2, 1, 2, 3, 4, 5, 6, 7, 8]);
        m.copy(0, 3, 7).unwrap();
        assert_eq!(m.read_bytes(0, 10).unwrap(), vec![2, 3, 4, 5, 6, 7, 8, 6, 7, 8]);
        assert!(m.copy(65530, 0, 10).is_err());
    }

    #[test]
    fn fill_sets_range() {
        let m = mem(1);
        m.fill(5, 0xab, 12).unwrap();
        assert_eq!(m.read_u8(4).unwrap(), 0);
        assert_eq!(m.read_bytes(5, 12).unwrap(), vec![0xab; 12]);
        assert_eq!(m.read_u8(17).unwrap(), 0);
    }

    #[test]
    fn segment_init_and_initialize() {
        let m = mem(1);
        m.init(10, b"hello", 1, 3).unwrap();
        assert_eq!(m.read_string(10, 3).unwrap(), "ell");
        assert!(m.init(10, b"hello", 3, 3).is_err());
        assert!(m.init(65535, b"hello", 0, 2).is_err());
        m.init(65536, b"", 0, 0).unwrap();

        let err = m.initialize([(0u64, &b"ab"[..]), (65535, &b"xyz"[..])]).unwrap_err();
        assert!(matches!(err, Error::Uninstantiable(_)));
        assert_eq!(m.read_string(0, 2).unwrap(), "ab");
    }

    #[test]
    fn cstrings() {
        let m = mem(1);
        m.write_cstring(32, "wasm").unwrap();
        assert_eq!(m.read_cstring(32).unwrap(), "wasm");
        m.fill(65530, b'x', 6).unwrap();
        assert!(m.read_cstring(65530).is_err());
        m.zero();
        assert_eq!(m.read_u32(32).unwrap(), 0);
    }

    #[test]
    fn atomics_check_alignment_and_width() {
        let m = mem(1);
        assert_eq!(m.atomic_load(2, 4), Err(Error::trap(UNALIGNED_ATOMIC)));
        assert!(m.atomic_load(65536, 4).unwrap_err().message().starts_with(OOB_MEMORY_ACCESS));
        m.write_u64(8, 0x1111_2222_3333_44ff).unwrap();
        assert_eq!(m.atomic_rmw(8, 1, RmwOp::Add, 1).unwrap(), 0xff);
        assert_eq!(m.read_u64(8).unwrap(), 0x1111_2222_3333_4400);
        assert_eq!(m.atomic_rmw(12, 4, RmwOp::Xchg, 5).unwrap(), 0x1111_2222);
        assert_eq!(m.atomic_cmpxchg(12, 4, 4, 9).unwrap(), 5);
        assert_eq!(m.atomic_load(12, 4).unwrap(), 5);
        assert_eq!(m.atomic_cmpxchg(12, 4, 5, 9).unwrap(), 5);
        assert_eq!(m.atomic_load(12, 4).unwrap(), 9);
        assert_eq!(m.atomic_rmw(16, 8, RmwOp::Sub, 1).unwrap(), 0);
        assert_eq!(m.read_i64(16).unwrap(), -1);
        m.atomic_store(24, 2, 0xabcd_1234).unwrap();
        assert_eq!(m.read_u32(24).unwrap(), 0x1234);
    }

    #[test]
    fn concurrent_atomic_adds_lose_nothing() {
        let m = Memory::new(MemoryLimits::shared(1, 1)).unwrap();
        const THREADS: i32 = 8;
        const ITERS: i32 = 10_000;
        m.write_i32(64, 5).unwrap();
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ITERS {
                        m.atomic_add_i32(64, 1).unwrap();
                    }
                });
            }
        });
        assert_eq!(m.read_i32(64).unwrap(), 5 + THREADS * ITERS);
    }

    #[test]
    fn narrow_atomics_do_not_disturb_neighbours() {
        let m = Memory::new(MemoryLimits::shared(1, 1)).unwrap();
        thread::scope(|s| {
            for byte in 0..8u64 {
                let m = &m;
                s.spawn(move || {
                    for _ in 0..1000 {
                        m.atomic_rmw(byte, 1, RmwOp::Add, 1).unwrap();
                    }
                });
            }
        });
        for byte in 0..8 {
            assert_eq!(m.read_u8(byte).unwrap(), (1000 % 256) as u8);
        }
    }

    #[test]
    fn reads_stay_valid_while_growing() {
        let m = Memory::new(MemoryLimits::shared(1, 64)).unwrap();
        m.write_u32(0, 42).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..63 {
                    assert_ne!(m.grow(1), u32::MAX);
                }
            });
            s.spawn(|| {
                for _ in 0..10_000 {
                    assert_eq!(m.atomic_load(0, 4).unwrap(), 42);
                }
            });
        });
        assert_eq!(m.pages(), 64);
        assert_eq!(m.read_u32(63 * 65536).unwrap(), 0);
    }

    #[test]
    fn wait_requires_shared_memory() {
        let m = mem(1);
        assert_eq!(m.wait32(0, 0, 0), Err(Error::trap(EXPECTED_SHARED_MEMORY)));
        assert_eq!(m.notify(0, 1), Ok(0));
    }

    #[test]
    fn wait_not_equal_and_timeout() {
        let m = Memory::new(MemoryLimits::shared(1, 1)).unwrap();
        m.write_i32(0, 1).unwrap();
        assert_eq!(m.wait32(0, 0, -1), Ok(WAIT_NOT_EQUAL));
        assert_eq!(m.wait32(0, 1, 1_000_000), Ok(WAIT_TIMED_OUT));
        assert_eq!(m.wait64(8, 0, 0), Ok(WAIT_TIMED_OUT));
        assert_eq!(m.notify(0, 5), Ok(0));
        assert_eq!(m.wait32(2, 0, 0), Err(Error::trap(UNALIGNED_ATOMIC)));
    }

    #[test]
    fn notify_wakes_waiter() {
        let m = Memory::new(MemoryLimits::shared(1, 1)).unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| m.wait32(16, 0, -1));
            while m.notify(16, 1).unwrap() == 0 {
                thread::yield_now();
            }
            assert_eq!(waiter.join().unwrap(), Ok(WAIT_OK));
        });
    }

    #[test]
    fn finished_waits_leave_no_monitors() {
        let m = Memory::new(MemoryLimits::shared(1, 1)).unwrap();
        m.write_i32(0, 1).unwrap();
        assert_eq!(m.wait32(0, 0, -1), Ok(WAIT_NOT_EQUAL));
        for addr in (8..8 * 64).step_by(8) {
            assert_eq!(m.wait64(addr, 0, 0), Ok(WAIT_TIMED_OUT));
        }
        assert!(lock(&m.wait_states).is_empty());

        thread::scope(|s| {
            let waiter = s.spawn(|| m.wait32(16, 0, -1));
            while m.notify(16, 1).unwrap() == 0 {
                thread::yield_now();
            }
            assert_eq!(waiter.join().unwrap(), Ok(WAIT_OK));
        });
        assert!(lock(&m.wait_states).is_empty());
    }

    #[test]
    fn oversized_limits_are_rejected() {
        let err = Memory::new(MemoryLimits::new(MAX_PAGES + 1, None)).unwrap_err();
        assert_eq!(err, Error::malformed(MEMORY_SIZE_LIMIT));
        let err = Memory::new(MemoryLimits::shared(1, MAX_PAGES + 1)).unwrap_err();
        assert_eq!(err, Error::malformed(MEMORY_SIZE_LIMIT));
        let err = Memory::new(MemoryLimits::shared(3, 2)).unwrap_err();
        assert_eq!(err, Error::malformed(SIZE_MIN_GREATER_THAN_MAX));
    }

    #[test]
    fn interrupt_cancels_wait() {
        let m = Memory::new(MemoryLimits::shared(1, 1)).unwrap();
        let flag = AtomicBool::new(false);
        thread::scope(|s| {
            let waiter = s.spawn(|| m.wait_on(0, 4, 0, -1, Some(&flag)));
            thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Release);
            assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));
        });
        assert!(!flag.load(Ordering::Acquire));
    }
}
