use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::trace;

use crate::device::CompNode;
use crate::dtype::WithDType;
use crate::error::{Error, Result};

// Storage — Allocator-owned memory seen through shared, read-only views
//
// The value algebra never owns memory. An Allocator (the collaborator) hands
// out word-aligned blocks; a block goes back to the allocator exactly once,
// when the last view referencing it is dropped.
//
// LIFECYCLE:
//
//   allocator.alloc ──► RawBuffer (unshared, writable: kernels fill it here)
//                          │ freeze()
//                          ▼
//                       Arc<Block> ──► HostTensorStorage / DeviceTensorStorage
//                                        (cheap clones, read-only views)
//                          │ last view dropped
//                          ▼
//                       allocator.free
//
// Blocks are stored as u64 words so typed views of any element up to 8 bytes
// are aligned at offset 0. All blocks are host-addressable: device memory is
// simulated in host memory by the reference collaborators.

/// Memory collaborator: hands out zeroed, word-aligned blocks.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate at least `bytes` bytes on `comp_node`, rounded up to whole words.
    fn alloc(&self, comp_node: CompNode, bytes: usize) -> Result<Box<[u64]>>;

    /// Take a block back. Called exactly once per successful `alloc`.
    fn free(&self, comp_node: CompNode, block: Box<[u64]>);
}

fn words_for(bytes: usize) -> usize {
    bytes.div_ceil(8)
}

/// Plain heap allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc(&self, _comp_node: CompNode, bytes: usize) -> Result<Box<[u64]>> {
        Ok(vec![0u64; words_for(bytes)].into_boxed_slice())
    }

    fn free(&self, _comp_node: CompNode, block: Box<[u64]>) {
        drop(block);
    }
}

/// The process-wide default allocator (a [`SystemAllocator`]).
pub fn default_allocator() -> Arc<dyn Allocator> {
    static DEFAULT: OnceLock<Arc<dyn Allocator>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(SystemAllocator)))
}

// CountingAllocator — instrumented wrapper

/// Snapshot of a [`CountingAllocator`]'s statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocStats {
    /// Successful allocations so far.
    pub allocs: u64,
    /// Blocks returned so far.
    pub frees: u64,
    /// Bytes currently handed out (word-rounded).
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
}

impl AllocStats {
    /// Blocks allocated and not yet returned.
    pub fn live_blocks(&self) -> u64 {
        self.allocs - self.frees
    }
}

/// Wraps another allocator and counts every alloc/free.
#[derive(Debug)]
pub struct CountingAllocator {
    inner: Arc<dyn Allocator>,
    allocs: AtomicU64,
    frees: AtomicU64,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl CountingAllocator {
    pub fn new(inner: Arc<dyn Allocator>) -> Self {
        CountingAllocator {
            inner,
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocs: self.allocs.load(Ordering::Acquire),
            frees: self.frees.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            peak_bytes: self.peak_bytes.load(Ordering::Acquire),
        }
    }
}

impl Default for CountingAllocator {
    fn default() -> Self {
        CountingAllocator::new(Arc::new(SystemAllocator))
    }
}

impl Allocator for CountingAllocator {
    fn alloc(&self, comp_node: CompNode, bytes: usize) -> Result<Box<[u64]>> {
        let block = self.inner.alloc(comp_node, bytes)?;
        let size = block.len() * 8;
        self.allocs.fetch_add(1, Ordering::AcqRel);
        let live = self.live_bytes.fetch_add(size, Ordering::AcqRel) + size;
        self.peak_bytes.fetch_max(live, Ordering::AcqRel);
        trace!("alloc {} bytes on {} (live {})", size, comp_node, live);
        Ok(block)
    }

    fn free(&self, comp_node: CompNode, block: Box<[u64]>) {
        let size = block.len() * 8;
        self.frees.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
        trace!("free {} bytes on {}", size, comp_node);
        self.inner.free(comp_node, block);
    }
}

// Block — one allocation, returned on drop

struct Block {
    words: Box<[u64]>,
    len: usize,
    comp_node: CompNode,
    allocator: Arc<dyn Allocator>,
}

impl Block {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let words = std::mem::take(&mut self.words);
        self.allocator.free(self.comp_node, words);
    }
}

fn typed_len<T>(bytes: usize) -> Result<usize> {
    let size = std::mem::size_of::<T>();
    if bytes % size != 0 {
        return Err(Error::Misaligned(format!(
            "{} bytes is not a multiple of element size {}",
            bytes, size
        )));
    }
    Ok(bytes / size)
}

/// An unshared, writable allocation. The only place tensor memory is written.
pub struct RawBuffer {
    block: Block,
}

impl RawBuffer {
    /// Allocate `bytes` zeroed bytes on `comp_node`.
    pub fn alloc(
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
        bytes: usize,
    ) -> Result<Self> {
        let words = allocator.alloc(comp_node, bytes)?;
        if words.len() * 8 < bytes {
            let got = words.len() * 8;
            allocator.free(comp_node, words);
            return Err(Error::Alloc {
                comp_node: comp_node.to_string(),
                bytes,
                reason: format!("allocator returned only {} bytes", got),
            });
        }
        Ok(RawBuffer {
            block: Block {
                words,
                len: bytes,
                comp_node,
                allocator: Arc::clone(allocator),
            },
        })
    }

    /// Allocate and copy `data` in.
    pub fn from_bytes(
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
        data: &[u8],
    ) -> Result<Self> {
        let mut buf = RawBuffer::alloc(allocator, comp_node, data.len())?;
        buf.as_bytes_mut().copy_from_slice(data);
        Ok(buf)
    }

    /// Allocate and copy typed elements in.
    pub fn from_slice<T: WithDType>(
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
        data: &[T],
    ) -> Result<Self> {
        RawBuffer::from_bytes(allocator, comp_node, bytemuck::cast_slice(data))
    }

    pub fn len(&self) -> usize {
        self.block.len
    }

    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    pub fn comp_node(&self) -> CompNode {
        self.block.comp_node
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.block.bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.block.bytes_mut()
    }

    /// Typed mutable view over the whole buffer.
    pub fn as_slice_mut<T: WithDType>(&mut self) -> Result<&mut [T]> {
        let n = typed_len::<T>(self.block.len)?;
        Ok(&mut bytemuck::cast_slice_mut::<u64, T>(&mut self.block.words)[..n])
    }

    /// Typed read-only view over the whole buffer.
    pub fn as_slice<T: WithDType>(&self) -> Result<&[T]> {
        let n = typed_len::<T>(self.block.len)?;
        Ok(&bytemuck::cast_slice::<u64, T>(&self.block.words)[..n])
    }

    fn freeze(self) -> Arc<Block> {
        Arc::new(self.block)
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("comp_node", &self.block.comp_node)
            .field("len", &self.block.len)
            .finish()
    }
}

// Storage views
//
// HostTensorStorage and DeviceTensorStorage share one implementation but are
// distinct types, so the HostStorage and DeviceStorage value kinds cannot be
// confused at compile time. TensorStorage lets tensor aggregates be written
// once over either of them.

/// Common interface of the two storage views.
pub trait TensorStorage: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Seal a written buffer into shared storage covering all of it.
    fn from_raw(buf: RawBuffer) -> Self;
    fn comp_node(&self) -> CompNode;
    /// Addressable extent in bytes.
    fn size(&self) -> usize;
    fn bytes(&self) -> &[u8];
}

macro_rules! storage_view {
    ($name:ident, $label:literal) => {
        #[doc = concat!("Shared, read-only view of ", $label, " memory owned by an allocator.")]
        #[derive(Clone)]
        pub struct $name {
            block: Arc<Block>,
            offset: usize,
            size: usize,
        }

        impl $name {
            /// Seal a written buffer into shared storage covering all of it.
            pub fn from_raw(buf: RawBuffer) -> Self {
                let size = buf.len();
                $name {
                    block: buf.freeze(),
                    offset: 0,
                    size,
                }
            }

            /// Allocate and copy `data` in.
            pub fn from_bytes(
                allocator: &Arc<dyn Allocator>,
                comp_node: CompNode,
                data: &[u8],
            ) -> Result<Self> {
                Ok($name::from_raw(RawBuffer::from_bytes(allocator, comp_node, data)?))
            }

            pub fn comp_node(&self) -> CompNode {
                self.block.comp_node
            }

            /// Addressable extent of this view in bytes.
            pub fn size(&self) -> usize {
                self.size
            }

            /// Byte offset of this view into its block.
            pub fn offset(&self) -> usize {
                self.offset
            }

            pub fn bytes(&self) -> &[u8] {
                &self.block.bytes()[self.offset..self.offset + self.size]
            }

            /// Typed zero-copy view; fails when the offset breaks alignment.
            pub fn as_slice<T: WithDType>(&self) -> Result<&[T]> {
                bytemuck::try_cast_slice(self.bytes())
                    .map_err(|e| Error::Misaligned(format!("{:?}", e)))
            }

            /// A narrower view sharing the same block.
            pub fn sub(&self, offset: usize, size: usize) -> Result<Self> {
                let end = offset.checked_add(size).unwrap_or(usize::MAX);
                if end > self.size {
                    return Err(Error::StorageTooSmall {
                        required: end,
                        available: self.size,
                    });
                }
                Ok($name {
                    block: Arc::clone(&self.block),
                    offset: self.offset + offset,
                    size,
                })
            }

            /// Whether both views read the same allocation.
            pub fn same_block(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.block, &other.block)
            }

            /// Number of live views on the underlying block.
            pub fn use_count(&self) -> usize {
                Arc::strong_count(&self.block)
            }
        }

        impl TensorStorage for $name {
            fn from_raw(buf: RawBuffer) -> Self {
                $name::from_raw(buf)
            }

            fn comp_node(&self) -> CompNode {
                $name::comp_node(self)
            }

            fn size(&self) -> usize {
                $name::size(self)
            }

            fn bytes(&self) -> &[u8] {
                $name::bytes(self)
            }
        }

        impl PartialEq for $name {
            /// Identity: same block, same window.
            fn eq(&self, other: &Self) -> bool {
                self.same_block(other) && self.offset == other.offset && self.size == other.size
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("comp_node", &self.block.comp_node)
                    .field("offset", &self.offset)
                    .field("size", &self.size)
                    .finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "{{device={}, offset={}, size={}}}",
                    self.block.comp_node, self.offset, self.size
                )
            }
        }
    };
}

storage_view!(HostTensorStorage, "host");
storage_view!(DeviceTensorStorage, "device");

#[cfg(test)]
mod tests {
    use super::*;

    fn counting() -> (Arc<CountingAllocator>, Arc<dyn Allocator>) {
        let counting = Arc::new(CountingAllocator::default());
        let dyn_alloc: Arc<dyn Allocator> = counting.clone();
        (counting, dyn_alloc)
    }

    #[test]
    fn test_raw_buffer_write_then_freeze() {
        let alloc = default_allocator();
        let mut buf = RawBuffer::alloc(&alloc, CompNode::cpu(0), 12).unwrap();
        buf.as_slice_mut::<f32>().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        let storage = HostTensorStorage::from_raw(buf);
        assert_eq!(storage.size(), 12);
        assert_eq!(storage.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_block_freed_once_after_last_view() {
        let (counting, alloc) = counting();
        let storage =
            DeviceTensorStorage::from_bytes(&alloc, CompNode::gpu(0), &[7u8; 16]).unwrap();
        let view = storage.sub(4, 8).unwrap();
        let copy = storage.clone();
        assert_eq!(storage.use_count(), 3);
        drop(storage);
        drop(copy);
        assert_eq!(counting.stats().frees, 0);
        assert_eq!(view.bytes(), &[7u8; 8]);
        drop(view);
        let stats = counting.stats();
        assert_eq!(stats.allocs, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, 16);
    }

    #[test]
    fn test_unfrozen_buffer_is_returned() {
        let (counting, alloc) = counting();
        let buf = RawBuffer::alloc(&alloc, CompNode::cpu(0), 3).unwrap();
        assert_eq!(counting.stats().live_blocks(), 1);
        drop(buf);
        assert_eq!(counting.stats().live_blocks(), 0);
    }

    #[test]
    fn test_sub_view_bounds_and_alignment() {
        let alloc = default_allocator();
        let storage =
            HostTensorStorage::from_bytes(&alloc, CompNode::cpu(0), &[0u8; 16]).unwrap();
        assert!(matches!(
            storage.sub(8, 16),
            Err(Error::StorageTooSmall { required: 24, available: 16 })
        ));
        let odd = storage.sub(1, 8).unwrap();
        assert!(matches!(odd.as_slice::<f32>(), Err(Error::Misaligned(_))));
        assert_eq!(storage.sub(4, 8).unwrap().as_slice::<f32>().unwrap().len(), 2);
    }

    #[test]
    fn test_storage_identity_equality() {
        let alloc = default_allocator();
        let a = HostTensorStorage::from_bytes(&alloc, CompNode::cpu(0), &[1, 2, 3, 4]).unwrap();
        let b = HostTensorStorage::from_bytes(&alloc, CompNode::cpu(0), &[1, 2, 3, 4]).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "{device=cpu0, offset=0, size=4}");
    }
}
