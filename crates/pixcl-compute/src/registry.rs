//! Handle-based device memory registry.
//!
//! Every device allocation is registered as a [`MemoryRecord`] (one or more
//! native buffers of one element type) behind a [`BufferHandle`]. Handles
//! are generation-checked indices: once a record is freed its handle never
//! resolves again, even after the slot is reused.
//!
//! # Concurrency
//!
//! The slot arena sits behind a single mutex taken for every insert,
//! remove, lookup and aggregate. Native buffers are released outside the
//! lock when the last `Arc` to them drops.
//!
//! # Failure policy
//!
//! Operations return `None` / empty / `0` and log instead of erroring.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::config::to_megabytes;
use crate::driver::DeviceDriver;
use crate::image::ImageObject;

// =============================================================================
// Element types
// =============================================================================

/// Element type a record was allocated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host element types that can live in device buffers.
pub trait DeviceElement: bytemuck::Pod + Send + Sync {
    const TYPE: ElementType;
}

macro_rules! device_element {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl DeviceElement for $t {
            const TYPE: ElementType = ElementType::$variant;
        })*
    };
}

device_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

// =============================================================================
// Handles and records
// =============================================================================

/// Opaque identity of one registered memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    /// Packed 64-bit form (generation in the high half).
    pub fn to_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.to_raw())
    }
}

/// Registered allocation: parallel lists of native buffers and element counts.
pub struct MemoryRecord<B> {
    buffers: Vec<Arc<B>>,
    lengths: Vec<usize>,
    element_type: ElementType,
}

impl<B> MemoryRecord<B> {
    /// Native buffers in allocation order.
    pub fn buffers(&self) -> &[Arc<B>] {
        &self.buffers
    }

    /// Element count per buffer.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// First (or only) buffer.
    pub fn first(&self) -> &Arc<B> {
        &self.buffers[0]
    }

    /// Element count of the first buffer.
    pub fn first_len(&self) -> usize {
        self.lengths[0]
    }

    /// Total size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.lengths.iter().sum::<usize>() as u64 * self.element_type.size() as u64
    }
}

impl<B> Clone for MemoryRecord<B> {
    fn clone(&self) -> Self {
        Self {
            buffers: self.buffers.clone(),
            lengths: self.lengths.clone(),
            element_type: self.element_type,
        }
    }
}

impl<B> fmt::Debug for MemoryRecord<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRecord")
            .field("lengths", &self.lengths)
            .field("element_type", &self.element_type)
            .finish()
    }
}

// =============================================================================
// Slot arena
// =============================================================================

struct Slot<B> {
    generation: u32,
    record: Option<MemoryRecord<B>>,
}

struct Arena<B> {
    slots: Vec<Slot<B>>,
    free: Vec<u32>,
}

impl<B> Arena<B> {
    fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    fn insert(&mut self, record: MemoryRecord<B>) -> BufferHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 1, record: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.record = Some(record);
        BufferHandle { index, generation: slot.generation }
    }

    fn get(&self, handle: BufferHandle) -> Option<&MemoryRecord<B>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_ref())
    }

    fn remove(&mut self, handle: BufferHandle) -> Option<MemoryRecord<B>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        Some(record)
    }

    fn iter(&self) -> impl Iterator<Item = (BufferHandle, &MemoryRecord<B>)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.record.as_ref().map(|r| {
                (BufferHandle { index: i as u32, generation: s.generation }, r)
            })
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe registry of device allocations on one device.
pub struct BufferRegistry<D: DeviceDriver> {
    driver: Arc<D>,
    arena: Mutex<Arena<D::Buffer>>,
}

impl<D: DeviceDriver> BufferRegistry<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            arena: Mutex::new(Arena::new()),
        }
    }

    /// Device this registry allocates on.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    fn register(&self, buffers: Vec<Arc<D::Buffer>>, lengths: Vec<usize>, element_type: ElementType) -> BufferHandle {
        let record = MemoryRecord { buffers, lengths, element_type };
        let bytes = record.size_bytes();
        let handle = self.arena.lock().unwrap().insert(record);
        debug!(handle = %handle, bytes, element_type = %element_type, "registered device memory");
        handle
    }

    fn create(&self, bytes: &[u8]) -> Option<Arc<D::Buffer>> {
        match self.driver.create_buffer(bytes) {
            Ok(buffer) => Some(Arc::new(buffer)),
            Err(e) => {
                warn!(bytes = bytes.len(), error = %e, "device allocation failed");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate `count` zero-initialized elements of a runtime element type.
    pub fn allocate(&self, element_type: ElementType, count: usize) -> Option<BufferHandle> {
        if count < 1 {
            warn!(count, "allocation requires at least one element");
            return None;
        }
        let buffer = self.create(&vec![0u8; count * element_type.size()])?;
        Some(self.register(vec![buffer], vec![count], element_type))
    }

    /// Allocate one buffer of `count` zero-initialized `T`.
    pub fn allocate_single<T: DeviceElement>(&self, count: usize) -> Option<BufferHandle> {
        self.allocate(T::TYPE, count)
    }

    /// Allocate `count` zero-initialized buffers of `size` elements as one record.
    pub fn allocate_group<T: DeviceElement>(&self, count: usize, size: usize) -> Option<BufferHandle> {
        if count < 1 || size < 1 {
            warn!(count, size, "group allocation requires non-empty buffers");
            return None;
        }
        let zeros = vec![0u8; size * T::TYPE.size()];
        let buffers = (0..count)
            .map(|_| self.create(&zeros))
            .collect::<Option<Vec<_>>>()?;
        Some(self.register(buffers, vec![size; count], T::TYPE))
    }

    /// Allocate and upload `data`.
    pub fn push<T: DeviceElement>(&self, data: &[T]) -> Option<BufferHandle> {
        if data.is_empty() {
            warn!("push of empty data");
            return None;
        }
        let buffer = self.create(bytemuck::cast_slice(data))?;
        Some(self.register(vec![buffer], vec![data.len()], T::TYPE))
    }

    /// Upload each chunk into its own buffer, grouped under one record.
    ///
    /// Any empty chunk or failed allocation aborts the whole group.
    pub fn push_chunks<T: DeviceElement, C: AsRef<[T]>>(&self, chunks: &[C]) -> Option<BufferHandle> {
        if chunks.is_empty() || chunks.iter().any(|c| c.as_ref().is_empty()) {
            warn!(chunks = chunks.len(), "push of empty chunk list or empty chunk");
            return None;
        }
        // Buffers created so far drop (and release) on early return.
        let buffers = chunks
            .iter()
            .map(|c| self.create(bytemuck::cast_slice(c.as_ref())))
            .collect::<Option<Vec<_>>>()?;
        let lengths = chunks.iter().map(|c| c.as_ref().len()).collect();
        Some(self.register(buffers, lengths, T::TYPE))
    }

    // -------------------------------------------------------------------------
    // Read-back
    // -------------------------------------------------------------------------

    fn read_into<T: DeviceElement>(&self, buffer: &D::Buffer, len: usize) -> Option<Vec<T>> {
        let mut out = vec![T::zeroed(); len];
        match self.driver.read_buffer(buffer, bytemuck::cast_slice_mut(&mut out)) {
            Ok(()) => Some(out),
            Err(e) => {
                warn!(error = %e, "device read failed");
                None
            }
        }
    }

    fn typed_record<T: DeviceElement>(&self, handle: BufferHandle) -> Option<MemoryRecord<D::Buffer>> {
        let Some(record) = self.get(handle) else {
            warn!(handle = %handle, "unknown buffer handle");
            return None;
        };
        if record.element_type != T::TYPE {
            warn!(
                handle = %handle,
                stored = %record.element_type,
                requested = %T::TYPE,
                "element type mismatch"
            );
            return None;
        }
        Some(record)
    }

    /// Read the first (or only) buffer back; frees the record unless `keep`.
    ///
    /// A failed read leaves the record registered.
    pub fn pull<T: DeviceElement>(&self, handle: BufferHandle, keep: bool) -> Vec<T> {
        let Some(record) = self.typed_record::<T>(handle) else {
            return Vec::new();
        };
        let Some(data) = self.read_into(record.first(), record.first_len()) else {
            return Vec::new();
        };
        drop(record);

        if !keep {
            self.free(handle, false);
        }
        data
    }

    /// Read every buffer of the record in order; one failure empties the result.
    pub fn pull_chunks<T: DeviceElement>(&self, handle: BufferHandle) -> Vec<Vec<T>> {
        let Some(record) = self.typed_record::<T>(handle) else {
            return Vec::new();
        };
        record
            .buffers
            .iter()
            .zip(&record.lengths)
            .map(|(buffer, &len)| self.read_into(buffer, len))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Release and lookup
    // -------------------------------------------------------------------------

    /// Release every buffer of the record. Unknown handles free 0 bytes.
    pub fn free(&self, handle: BufferHandle, readable: bool) -> u64 {
        let removed = self.arena.lock().unwrap().remove(handle);
        let Some(record) = removed else {
            trace!(handle = %handle, "free of unknown handle");
            return 0;
        };

        let bytes = record.size_bytes();
        drop(record);
        debug!(handle = %handle, bytes, "freed device memory");
        if readable { to_megabytes(bytes) } else { bytes }
    }

    /// Snapshot of the record behind `handle`.
    pub fn get(&self, handle: BufferHandle) -> Option<MemoryRecord<D::Buffer>> {
        self.arena.lock().unwrap().get(handle).cloned()
    }

    pub fn get_element_type(&self, handle: BufferHandle) -> Option<ElementType> {
        self.arena.lock().unwrap().get(handle).map(|r| r.element_type)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.arena.lock().unwrap().get(handle).is_some()
    }

    /// Live handles in slot order.
    pub fn handles(&self) -> Vec<BufferHandle> {
        self.arena.lock().unwrap().iter().map(|(h, _)| h).collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.arena.lock().unwrap().iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    /// Device-reported capacity.
    pub fn memory_total(&self, readable: bool) -> u64 {
        let bytes = self.driver.descriptor().global_memory;
        if readable { to_megabytes(bytes) } else { bytes }
    }

    /// Sum of registered record sizes.
    pub fn memory_used(&self, readable: bool) -> u64 {
        let bytes: u64 = self
            .arena
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.size_bytes())
            .sum();
        if readable { to_megabytes(bytes) } else { bytes }
    }

    /// Capacity minus usage, saturating at zero.
    pub fn memory_free(&self, readable: bool) -> u64 {
        let bytes = self
            .memory_total(false)
            .saturating_sub(self.memory_used(false));
        if readable { to_megabytes(bytes) } else { bytes }
    }

    // -------------------------------------------------------------------------
    // Images
    // -------------------------------------------------------------------------

    /// Move a host-resident image's pixels to the device.
    ///
    /// On failure the image keeps its pixels.
    pub fn push_image(&self, image: &mut ImageObject) -> Option<BufferHandle> {
        if image.is_on_device() {
            return image.device_handle();
        }
        let pixels = image.get_bytes(false);
        if pixels.is_empty() {
            warn!(image = %image.id(), "image has no pixels to push");
            return None;
        }

        match self.push(&pixels) {
            Some(handle) => {
                image.set_device_handle(handle);
                Some(handle)
            }
            None => {
                image.set_pixels(pixels);
                None
            }
        }
    }

    /// Move a device-resident image's pixels back to the host (frees the record).
    ///
    /// On failure the image keeps its device handle and the record stays live.
    pub fn pull_image(&self, image: &mut ImageObject) -> bool {
        let Some(handle) = image.device_handle() else {
            return image.is_on_host();
        };
        let pixels = self.pull::<u8>(handle, false);
        if pixels.is_empty() {
            warn!(image = %image.id(), handle = %handle, "image pull failed");
            return false;
        }
        image.set_pixels(pixels);
        true
    }
}
