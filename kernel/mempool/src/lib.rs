//! Memory pools of packet buffers.
//!
//! A [`Mempool`] carves one DMA region into `num_entries` equally-sized entries,
//! writes a [`PacketBuffer`] header into each, and hands them out from a
//! fixed-capacity LIFO free stack. Buffers are returned to the pool they came from,
//! which is found through the [`MempoolRegistry`] by the id stored in every buffer.
//!
//! Pools are shared between queues through an `Arc`; the free stack is behind a spinlock.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate memory_structs;
extern crate kernel_config;
extern crate dma_memory;
extern crate nic_buffers;


use core::fmt;
use alloc::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    vec::Vec,
};
use spin::Mutex;
use memory_structs::VirtualAddress;
use kernel_config::memory::HUGE_PAGE_SIZE;
use dma_memory::{DmaAllocator, DmaError, DmaRegion};
use nic_buffers::{PacketBuffer, DATA_OFFSET};


/// The parameters of a new mempool.
#[derive(Clone, Copy, Debug)]
pub struct MempoolConfig {
    /// Number of buffers in the pool.
    pub num_entries: usize,
    /// Size in bytes of each entry, header and headroom included.
    pub entry_size: usize,
    /// The id to register the pool under; the lowest free id is picked if `None`.
    pub id: Option<i64>,
}

impl MempoolConfig {
    pub fn new(num_entries: usize, entry_size: usize) -> MempoolConfig {
        MempoolConfig { num_entries, entry_size, id: None }
    }

    /// Requests a specific pool id.
    pub fn with_id(mut self, id: i64) -> MempoolConfig {
        self.id = Some(id);
        self
    }

    fn validate(&self) -> Result<(), MempoolError> {
        if self.num_entries == 0 {
            return Err(MempoolError::InvalidConfiguration("a mempool needs at least one entry"));
        }
        if self.entry_size <= DATA_OFFSET {
            return Err(MempoolError::InvalidConfiguration("entry size must be larger than the packet buffer header"));
        }
        if self.entry_size > u32::MAX as usize {
            return Err(MempoolError::InvalidConfiguration("entry size must fit in 32 bits"));
        }
        if HUGE_PAGE_SIZE % self.entry_size != 0 {
            return Err(MempoolError::InvalidConfiguration("entry size must evenly divide a huge page"));
        }
        if u32::try_from(self.num_entries).is_err() {
            return Err(MempoolError::InvalidConfiguration("too many entries"));
        }
        if matches!(self.id, Some(id) if id < 0) {
            return Err(MempoolError::InvalidConfiguration("mempool ids must be non-negative"));
        }
        Ok(())
    }
}


/// The errors that can occur when creating a mempool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MempoolError {
    /// A live pool is already registered under the requested id.
    DuplicateId(i64),
    /// The pool's size parameters are unusable.
    InvalidConfiguration(&'static str),
    /// The DMA memory for the pool couldn't be obtained.
    Dma(DmaError),
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MempoolError::DuplicateId(id) => write!(f, "a mempool with id {} already exists", id),
            MempoolError::InvalidConfiguration(msg) => write!(f, "invalid mempool configuration: {}", msg),
            MempoolError::Dma(e) => write!(f, "mempool DMA allocation failed: {}", e),
        }
    }
}

impl From<DmaError> for MempoolError {
    fn from(e: DmaError) -> Self {
        MempoolError::Dma(e)
    }
}

impl From<MempoolError> for &'static str {
    fn from(error: MempoolError) -> Self {
        match error {
            MempoolError::DuplicateId(_) => "a mempool with the requested id already exists",
            MempoolError::InvalidConfiguration(msg) => msg,
            MempoolError::Dma(e) => e.into(),
        }
    }
}


/// A LIFO stack of free buffers that never grows past the capacity it was created with.
struct FreeStack {
    entries: Vec<PacketBuffer>,
    capacity: usize,
}

impl FreeStack {
    fn with_capacity(capacity: usize) -> FreeStack {
        FreeStack { entries: Vec::with_capacity(capacity), capacity }
    }

    /// Gives the buffer back if the stack is already full.
    fn push(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        if self.entries.len() >= self.capacity {
            Err(buf)
        } else {
            self.entries.push(buf);
            Ok(())
        }
    }

    fn pop(&mut self) -> Option<PacketBuffer> {
        self.entries.pop()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}


/// A fixed-size pool of packet buffers carved out of one DMA region.
pub struct Mempool {
    id: i64,
    region: DmaRegion,
    entry_size: usize,
    num_entries: usize,
    free_stack: Mutex<FreeStack>,
}

impl Mempool {
    /// Allocates DMA memory for a new pool, initializes every buffer in it,
    /// and registers the pool in `registry`.
    ///
    /// All buffers start out free. The first buffer allocated from a fresh pool
    /// is the one at the lowest address.
    pub fn create(
        registry: &MempoolRegistry,
        allocator: &dyn DmaAllocator,
        config: MempoolConfig,
    ) -> Result<Arc<Mempool>, MempoolError> {
        config.validate()?;
        let total_size = config.num_entries.checked_mul(config.entry_size)
            .ok_or(MempoolError::InvalidConfiguration("mempool size overflows"))?;

        // hold the registry lock from picking the id until the pool is registered
        let mut pools = registry.pools.lock();
        let id = match config.id {
            Some(id) if pools.contains_key(&id) => return Err(MempoolError::DuplicateId(id)),
            Some(id) => id,
            None => (0i64..).find(|id| !pools.contains_key(id))
                .ok_or(MempoolError::InvalidConfiguration("no free mempool id"))?,
        };

        let region = allocator.allocate_dma_region(total_size)?;
        let capacity = (config.entry_size - DATA_OFFSET) as u32;
        let mut free_stack = FreeStack::with_capacity(config.num_entries);
        // push in reverse so that the lowest entry is on top of the stack
        for index in (0..config.num_entries).rev() {
            let vaddr = region.virt_addr() + index * config.entry_size;
            let paddr = allocator.virt_to_phys(vaddr)?;
            // SAFETY: the entry lies within the freshly-allocated region and nothing else refers to it.
            let buf = unsafe { PacketBuffer::init(vaddr, paddr, id, index as u32, capacity) }
                .ok_or(MempoolError::Dma(DmaError::UnknownAddress(vaddr)))?;
            if free_stack.push(buf).is_err() {
                return Err(MempoolError::InvalidConfiguration("free stack overflow during init"));
            }
        }

        let pool = Arc::new(Mempool {
            id,
            region,
            entry_size: config.entry_size,
            num_entries: config.num_entries,
            free_stack: Mutex::new(free_stack),
        });
        pools.insert(id, pool.clone());
        debug!("Mempool {}: {} entries of {} bytes at {:?}", id, config.num_entries, config.entry_size, region.virt_addr());
        Ok(pool)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// The virtual address of the first entry.
    pub fn base_addr(&self) -> VirtualAddress {
        self.region.virt_addr()
    }

    /// The number of buffers currently in the free stack.
    pub fn available(&self) -> usize {
        self.free_stack.lock().len()
    }

    /// Takes a buffer from the pool, or returns `None` if the pool is empty.
    pub fn try_alloc_buf(&self) -> Option<PacketBuffer> {
        self.free_stack.lock().pop()
    }

    /// Takes a buffer from the pool, logging a warning if the pool is empty.
    pub fn alloc_buf(&self) -> Option<PacketBuffer> {
        let buf = self.try_alloc_buf();
        if buf.is_none() {
            warn!("Mempool {}: no free buffers", self.id);
        }
        buf
    }

    /// Takes up to `count` buffers from the pool and appends them to `bufs`.
    ///
    /// Returns the number of buffers actually taken, which is less than `count`
    /// if the pool ran low.
    pub fn alloc_batch(&self, bufs: &mut VecDeque<PacketBuffer>, count: usize) -> usize {
        let mut stack = self.free_stack.lock();
        let n = count.min(stack.len());
        for _ in 0..n {
            if let Some(buf) = stack.pop() {
                bufs.push_back(buf);
            }
        }
        drop(stack);
        if n < count {
            warn!("Mempool {}: only {} of {} requested buffers available", self.id, n, count);
        }
        n
    }

    /// Returns true if `buf` is one of this pool's entries.
    pub fn owns(&self, buf: &PacketBuffer) -> bool {
        let vaddr = buf.virt_addr();
        buf.pool_id() == self.id
            && vaddr >= self.base_addr()
            && (vaddr - self.base_addr()) < self.num_entries * self.entry_size
            && (vaddr - self.base_addr()) % self.entry_size == 0
    }

    /// Returns a buffer to the pool.
    ///
    /// The buffer is handed back if it doesn't belong to this pool or if the
    /// pool's free stack is already full, which indicates a double free.
    pub fn free_buf(&self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        if !self.owns(&buf) {
            warn!("Mempool {}: refusing to free foreign buffer {:?}", self.id, buf);
            return Err(buf);
        }
        self.free_stack.lock().push(buf).map_err(|buf| {
            warn!("Mempool {}: free stack is full, refusing to free {:?} (double free?)", self.id, buf);
            buf
        })
    }

    /// Returns every buffer in `bufs` to the pool, draining the deque.
    ///
    /// Returns the number of buffers the pool refused; those are dropped
    /// without being freed and their entries stay out of circulation.
    pub fn free_batch(&self, bufs: &mut VecDeque<PacketBuffer>) -> usize {
        let mut refused = 0;
        for buf in bufs.drain(..) {
            if self.free_buf(buf).is_err() {
                refused += 1;
            }
        }
        refused
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("id", &self.id)
            .field("base", &self.region.virt_addr())
            .field("entry_size", &self.entry_size)
            .field("num_entries", &self.num_entries)
            .field("available", &self.available())
            .finish()
    }
}


/// The table of live mempools, keyed by id.
///
/// Anything holding only a buffer (and therefore only its pool id) uses this
/// to find the pool the buffer must be returned to.
#[derive(Default)]
pub struct MempoolRegistry {
    pools: Mutex<BTreeMap<i64, Arc<Mempool>>>,
}

impl MempoolRegistry {
    pub fn new() -> MempoolRegistry {
        MempoolRegistry::default()
    }

    /// Returns the live pool with the given id.
    pub fn find(&self, id: i64) -> Option<Arc<Mempool>> {
        self.pools.lock().get(&id).cloned()
    }

    /// Removes the pool with the given id from the registry, making the id reusable.
    ///
    /// The pool's DMA memory is not reclaimed.
    pub fn destroy(&self, id: i64) -> Option<Arc<Mempool>> {
        let removed = self.pools.lock().remove(&id);
        if removed.is_some() {
            debug!("Mempool {} destroyed", id);
        }
        removed
    }

    /// Returns the pool that owns `buf`, looked up by the id stored in its header.
    pub fn owner_of(&self, buf: &PacketBuffer) -> Option<Arc<Mempool>> {
        self.find(buf.pool_id())
    }

    /// The number of live pools.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// The ids of all live pools, in ascending order.
    pub fn ids(&self) -> Vec<i64> {
        self.pools.lock().keys().copied().collect()
    }
}
