// src/alloc/node.rs
//! Memory node headers and the pool node ring.
//!
//! A [`MemNode`] sits at the start of every block handed out by an
//! [`Allocator`](crate::Allocator): header first, bump space after. Inside a
//! pool, nodes form a circular list spliced through `refp`, which always
//! points at *the slot that points at this node* rather than at the previous
//! node itself. That keeps insert/remove branch-free and lets any node reach
//! the slot it hangs from without walking the ring.

use crate::config::align_default;

/// Header of a single allocator block.
///
/// Invariants: `first_avail <= endp`, and whenever the node is linked into a
/// ring, `*refp == self`.
#[repr(C)]
pub struct MemNode {
    /// Next node in the ring (or bucket freelist).
    pub(crate) next: *mut MemNode,
    /// The slot pointing at this node; used to splice without a prev link.
    pub(crate) refp: *mut *mut MemNode,
    /// Size class: total footprint in `BOUNDARY_SIZE` units, minus one.
    pub(crate) index: u32,
    /// Rounded-down count of whole free boundary units left; maintained by
    /// the pool to keep its ring sorted by descending free space.
    pub(crate) free_index: u32,
    /// Bump pointer.
    pub(crate) first_avail: *mut u8,
    /// One past the last payload byte.
    pub(crate) endp: *mut u8,
}

/// Header footprint, padded to the default alignment so payloads start
/// 16-aligned.
pub const SIZEOF_MEMNODE: usize = align_default(size_of::<MemNode>());

impl MemNode {
    /// Writes a fresh header at `base` for a block of `total` bytes and
    /// returns it with the bump pointer just past the header.
    ///
    /// # Safety
    ///
    /// `base` must be valid for writes of `total` bytes and `total` must be
    /// at least `SIZEOF_MEMNODE`.
    pub(crate) unsafe fn init_at(base: *mut u8, index: u32, total: usize) -> *mut MemNode {
        unsafe {
            let node = base as *mut MemNode;
            (*node).next = std::ptr::null_mut();
            (*node).refp = std::ptr::null_mut();
            (*node).index = index;
            (*node).free_index = 0;
            (*node).first_avail = base.add(SIZEOF_MEMNODE);
            (*node).endp = base.add(total);
            node
        }
    }

    /// Turns `node` into a one-element ring (`next` pointing at itself).
    ///
    /// # Safety
    ///
    /// `node` must point to a live header that is not linked anywhere.
    pub(crate) unsafe fn make_ring(node: *mut MemNode) {
        unsafe {
            (*node).next = node;
            (*node).refp = &raw mut (*node).next;
        }
    }

    /// Splices `node` into the ring in place of `point`; `point` ends up
    /// immediately after `node`.
    ///
    /// # Safety
    ///
    /// Both pointers must be live headers and `point` must be ring-linked.
    pub(crate) unsafe fn insert(node: *mut MemNode, point: *mut MemNode) {
        unsafe {
            (*node).refp = (*point).refp;
            *(*node).refp = node;
            (*node).next = point;
            (*point).refp = &raw mut (*node).next;
        }
    }

    /// Unlinks `node` from its ring.
    ///
    /// # Safety
    ///
    /// `node` must be ring-linked.
    pub(crate) unsafe fn remove(node: *mut MemNode) {
        unsafe {
            *(*node).refp = (*node).next;
            (*(*node).next).refp = (*node).refp;
        }
    }

    /// Bytes left between the bump pointer and the end of the payload.
    ///
    /// # Safety
    ///
    /// `node` must point to a live header.
    #[inline]
    pub(crate) unsafe fn free_space(node: *const MemNode) -> usize {
        unsafe { (*node).endp as usize - (*node).first_avail as usize }
    }

    /// Total block footprint implied by the size class.
    #[inline]
    pub(crate) fn footprint(index: u32) -> usize {
        (index as usize + 1) << crate::config::BOUNDARY_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BOUNDARY_SIZE, align};
    use std::alloc::{Layout, alloc, dealloc};

    unsafe fn heap_node(payload: usize) -> *mut MemNode {
        unsafe {
            let total = align(payload + SIZEOF_MEMNODE, BOUNDARY_SIZE);
            let index = ((total >> crate::config::BOUNDARY_INDEX) - 1) as u32;
            let layout = Layout::from_size_align(total, crate::config::ALIGN_DEFAULT).unwrap();
            MemNode::init_at(alloc(layout), index, total)
        }
    }

    unsafe fn heap_free(node: *mut MemNode) {
        unsafe {
            let total = MemNode::footprint((*node).index);
            let layout = Layout::from_size_align(total, crate::config::ALIGN_DEFAULT).unwrap();
            dealloc(node as *mut u8, layout);
        }
    }

    #[test]
    fn test_init_at_layout() {
        unsafe {
            let node = heap_node(100);
            assert_eq!((*node).index, 0);
            assert_eq!((*node).first_avail as usize, node as usize + SIZEOF_MEMNODE);
            assert_eq!(MemNode::free_space(node), BOUNDARY_SIZE - SIZEOF_MEMNODE);
            assert_eq!((*node).first_avail as usize % 16, 0);
            heap_free(node);
        }
    }

    #[test]
    fn test_ring_insert_remove() {
        unsafe {
            let a = heap_node(64);
            let b = heap_node(64);
            let c = heap_node(64);

            MemNode::make_ring(a);
            assert_eq!((*a).next, a);
            assert_eq!(*(*a).refp, a);

            // b takes a's position; ring order is now b -> a -> b.
            MemNode::insert(b, a);
            assert_eq!((*b).next, a);
            assert_eq!((*a).next, b);
            assert_eq!(*(*a).refp, a);
            assert_eq!(*(*b).refp, b);

            MemNode::insert(c, a);
            assert_eq!((*b).next, c);
            assert_eq!((*c).next, a);

            MemNode::remove(c);
            assert_eq!((*b).next, a);
            assert_eq!(*(*a).refp, a);

            heap_free(a);
            heap_free(b);
            heap_free(c);
        }
    }

    #[test]
    fn test_footprint_roundtrip() {
        assert_eq!(MemNode::footprint(0), BOUNDARY_SIZE);
        assert_eq!(MemNode::footprint(1), 2 * BOUNDARY_SIZE);
        assert_eq!(MemNode::footprint(19), 20 * BOUNDARY_SIZE);
    }
}
