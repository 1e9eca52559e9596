//! Segmented big buffers: a logically huge flat array of fixed-width
//! elements paged across bounded physical segments, allocated lazily on
//! first access through an injected allocator capability.

use std::sync::{Arc, RwLock};

/// Elements per segment of a [`BigDoubleBuffer`].
pub const DOUBLE_SEGMENT_CAPACITY: usize = 1 << 16;

/// Entries per segment of a [`BigStringBuffer`].
pub const STRING_SEGMENT_CAPACITY: usize = 1 << 14;

/// Allocator capability backing segment storage.
///
/// Returns a zero-initialized byte region of exactly `capacity` bytes. The
/// buffers call it exactly once per newly touched segment and never resize
/// or reuse a returned region, so an implementation may hand out heap
/// memory, memory-mapped file slices, or instrumented test regions.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, capacity: usize) -> Vec<u8>;
}

/// Default heap-backed allocator.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> Vec<u8> {
        vec![0u8; capacity]
    }
}

fn read_f64(bytes: &[u8], local: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[local * 8..local * 8 + 8]);
    f64::from_le_bytes(b)
}

fn write_f64(bytes: &mut [u8], local: usize, value: f64) {
    bytes[local * 8..local * 8 + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], local: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[local * 4..local * 4 + 4]);
    u32::from_le_bytes(b)
}

fn write_u32(bytes: &mut [u8], local: usize, value: u32) {
    bytes[local * 4..local * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

/// A flat f64 array of logical size `size`, paged across segments of
/// [`DOUBLE_SEGMENT_CAPACITY`] elements. Segments are created on the first
/// read or write that addresses them and freed only when the buffer is
/// dropped.
///
/// No bounds are imposed beyond the caller-supplied logical size: a
/// `global_index >= size` is a caller error (checked by `debug_assert!`
/// only).
pub struct BigDoubleBuffer {
    size: usize,
    default_value: f64,
    allocator: Arc<dyn BufferAllocator>,
    segments: RwLock<Vec<Option<Vec<u8>>>>,
}

impl BigDoubleBuffer {
    pub fn new(size: usize, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self::with_default(size, 0.0, allocator)
    }

    /// A buffer whose untouched elements read back as `default_value`
    /// (e.g. NaN for missing-point sentinels).
    pub fn with_default(size: usize, default_value: f64, allocator: Arc<dyn BufferAllocator>) -> Self {
        let segment_count = size.div_ceil(DOUBLE_SEGMENT_CAPACITY);
        Self {
            size,
            default_value,
            allocator,
            segments: RwLock::new((0..segment_count).map(|_| None).collect()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of physically allocated segments.
    pub fn segment_count(&self) -> usize {
        self.segments
            .read()
            .expect("segment lock")
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    fn new_segment(&self) -> Vec<u8> {
        let mut bytes = self.allocator.allocate(DOUBLE_SEGMENT_CAPACITY * 8);
        if self.default_value != 0.0 {
            for local in 0..DOUBLE_SEGMENT_CAPACITY {
                write_f64(&mut bytes, local, self.default_value);
            }
        }
        bytes
    }

    pub fn put(&mut self, global_index: usize, value: f64) {
        debug_assert!(global_index < self.size);
        let segment = global_index / DOUBLE_SEGMENT_CAPACITY;
        let local = global_index % DOUBLE_SEGMENT_CAPACITY;
        let allocator = Arc::clone(&self.allocator);
        let default_value = self.default_value;
        let segments = self.segments.get_mut().expect("segment lock");
        let bytes = segments[segment].get_or_insert_with(|| {
            let mut b = allocator.allocate(DOUBLE_SEGMENT_CAPACITY * 8);
            if default_value != 0.0 {
                for l in 0..DOUBLE_SEGMENT_CAPACITY {
                    write_f64(&mut b, l, default_value);
                }
            }
            b
        });
        write_f64(bytes, local, value);
    }

    pub fn get(&self, global_index: usize) -> f64 {
        debug_assert!(global_index < self.size);
        let segment = global_index / DOUBLE_SEGMENT_CAPACITY;
        let local = global_index % DOUBLE_SEGMENT_CAPACITY;
        {
            let segments = self.segments.read().expect("segment lock");
            if let Some(bytes) = &segments[segment] {
                return read_f64(bytes, local);
            }
        }
        let mut segments = self.segments.write().expect("segment lock");
        let bytes = segments[segment].get_or_insert_with(|| self.new_segment());
        read_f64(bytes, local)
    }
}

impl std::fmt::Debug for BigDoubleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigDoubleBuffer")
            .field("size", &self.size)
            .field("segments", &self.segment_count())
            .finish()
    }
}

/// Dense array of string slots over a shared byte area.
///
/// Each slot holds a u32 offset into the area; the zero offset represents
/// null, so byte 0 of the area is reserved. Entries are length-prefixed
/// UTF-8. Duplicate strings may be stored independently: there is no
/// deduplication guarantee.
pub struct CompactStringBuffer {
    offsets: Vec<u8>,
    capacity: usize,
    data: Vec<u8>,
}

impl CompactStringBuffer {
    pub fn new(allocator: &dyn BufferAllocator, capacity: usize) -> Self {
        Self {
            offsets: allocator.allocate(capacity * 4),
            capacity,
            // index 0 is the null sentinel, keep it unused
            data: vec![0u8],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn put_string(&mut self, index: usize, value: Option<&str>) {
        debug_assert!(index < self.capacity);
        match value {
            None => write_u32(&mut self.offsets, index, 0),
            Some(s) => {
                let offset = self.data.len() as u32;
                self.data.extend_from_slice(&(s.len() as u32).to_le_bytes());
                self.data.extend_from_slice(s.as_bytes());
                write_u32(&mut self.offsets, index, offset);
            }
        }
    }

    pub fn get_string(&self, index: usize) -> Option<String> {
        debug_assert!(index < self.capacity);
        let offset = read_u32(&self.offsets, index) as usize;
        if offset == 0 {
            return None;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.data[offset..offset + 4]);
        let len = u32::from_le_bytes(len) as usize;
        let bytes = &self.data[offset + 4..offset + 4 + len];
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl std::fmt::Debug for CompactStringBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactStringBuffer")
            .field("capacity", &self.capacity)
            .field("data_bytes", &self.data.len())
            .finish()
    }
}

/// A flat nullable-string array of logical size `size`, paged across
/// [`CompactStringBuffer`] segments of [`STRING_SEGMENT_CAPACITY`] entries.
/// Same lazy-allocation contract as [`BigDoubleBuffer`].
pub struct BigStringBuffer {
    size: usize,
    allocator: Arc<dyn BufferAllocator>,
    segments: RwLock<Vec<Option<CompactStringBuffer>>>,
}

impl BigStringBuffer {
    pub fn new(size: usize, allocator: Arc<dyn BufferAllocator>) -> Self {
        let segment_count = size.div_ceil(STRING_SEGMENT_CAPACITY);
        Self {
            size,
            allocator,
            segments: RwLock::new((0..segment_count).map(|_| None).collect()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn segment_count(&self) -> usize {
        self.segments
            .read()
            .expect("segment lock")
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    pub fn put_string(&mut self, global_index: usize, value: Option<&str>) {
        debug_assert!(global_index < self.size);
        let segment = global_index / STRING_SEGMENT_CAPACITY;
        let local = global_index % STRING_SEGMENT_CAPACITY;
        let allocator = Arc::clone(&self.allocator);
        let segments = self.segments.get_mut().expect("segment lock");
        let buffer = segments[segment]
            .get_or_insert_with(|| CompactStringBuffer::new(&*allocator, STRING_SEGMENT_CAPACITY));
        buffer.put_string(local, value);
    }

    pub fn get_string(&self, global_index: usize) -> Option<String> {
        debug_assert!(global_index < self.size);
        let segment = global_index / STRING_SEGMENT_CAPACITY;
        let local = global_index % STRING_SEGMENT_CAPACITY;
        {
            let segments = self.segments.read().expect("segment lock");
            if let Some(buffer) = &segments[segment] {
                return buffer.get_string(local);
            }
        }
        let mut segments = self.segments.write().expect("segment lock");
        let buffer = segments[segment]
            .get_or_insert_with(|| CompactStringBuffer::new(&*self.allocator, STRING_SEGMENT_CAPACITY));
        buffer.get_string(local)
    }
}

impl std::fmt::Debug for BigStringBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigStringBuffer")
            .field("size", &self.size)
            .field("segments", &self.segment_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Allocator test double counting allocation calls.
    struct CountingAllocator {
        calls: AtomicUsize,
    }

    impl CountingAllocator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl BufferAllocator for CountingAllocator {
        fn allocate(&self, capacity: usize) -> Vec<u8> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![0u8; capacity]
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut buffer = BigDoubleBuffer::new(10, Arc::new(HeapAllocator));
        buffer.put(0, 1.5);
        buffer.put(9, -2.5);
        buffer.put(9, 3.5); // last write wins
        assert_eq!(1.5, buffer.get(0));
        assert_eq!(3.5, buffer.get(9));
        assert_eq!(0.0, buffer.get(5));
    }

    #[test]
    fn default_value_reads_back_from_untouched_slots() {
        let buffer =
            BigDoubleBuffer::with_default(10, f64::NAN, Arc::new(HeapAllocator));
        assert!(buffer.get(3).is_nan());
    }

    #[test]
    fn one_allocation_per_touched_segment() {
        let allocator = Arc::new(CountingAllocator::new());
        let size = 3 * DOUBLE_SEGMENT_CAPACITY + 1;
        let mut buffer = BigDoubleBuffer::new(size, Arc::clone(&allocator) as Arc<dyn BufferAllocator>);

        // touch every segment boundary in increasing order
        for segment in 0..4 {
            let index = (segment * DOUBLE_SEGMENT_CAPACITY).min(size - 1);
            buffer.put(index, segment as f64);
        }
        assert_eq!(4, allocator.calls.load(Ordering::SeqCst));
        assert_eq!(4, buffer.segment_count());

        // re-touching does not allocate again
        buffer.put(0, 42.0);
        let _ = buffer.get(DOUBLE_SEGMENT_CAPACITY);
        assert_eq!(4, allocator.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn get_allocates_lazily_too() {
        let allocator = Arc::new(CountingAllocator::new());
        let buffer = BigDoubleBuffer::new(
            2 * DOUBLE_SEGMENT_CAPACITY,
            Arc::clone(&allocator) as Arc<dyn BufferAllocator>,
        );
        assert_eq!(0, allocator.calls.load(Ordering::SeqCst));
        assert_eq!(0.0, buffer.get(DOUBLE_SEGMENT_CAPACITY + 7));
        assert_eq!(1, allocator.calls.load(Ordering::SeqCst));
        assert_eq!(1, buffer.segment_count());
    }

    #[test]
    fn compact_string_buffer_null_and_duplicates() {
        let mut buffer = CompactStringBuffer::new(&HeapAllocator, 8);
        assert_eq!(None, buffer.get_string(0));
        buffer.put_string(0, Some("hello"));
        buffer.put_string(1, Some("hello"));
        buffer.put_string(2, None);
        assert_eq!(Some("hello".to_string()), buffer.get_string(0));
        assert_eq!(Some("hello".to_string()), buffer.get_string(1));
        assert_eq!(None, buffer.get_string(2));
        // overwrite with null
        buffer.put_string(0, None);
        assert_eq!(None, buffer.get_string(0));
    }

    #[test]
    fn big_string_buffer_round_trips_across_segments() {
        let size = STRING_SEGMENT_CAPACITY + 5;
        let mut buffer = BigStringBuffer::new(size, Arc::new(HeapAllocator));
        buffer.put_string(0, Some("a"));
        buffer.put_string(STRING_SEGMENT_CAPACITY + 1, Some("b"));
        assert_eq!(Some("a".to_string()), buffer.get_string(0));
        assert_eq!(Some("b".to_string()), buffer.get_string(STRING_SEGMENT_CAPACITY + 1));
        assert_eq!(None, buffer.get_string(3));
        assert_eq!(2, buffer.segment_count());
    }
}
