//! Size-classed free lists for segment storage and CDF line arrays.
//!
//! Buffers below a size limit are recycled through one free list per size
//! class; larger buffers go straight to the global allocator. Each
//! [`Pooled`] buffer remembers the class it was taken from so it returns
//! to the same list even after its owner changed size.

use std::ops::{Deref, DerefMut};

use crate::bucket::{Slot, BLOCK};
use crate::cdf::Line;

/// Number of slot-array classes (1..=20 blocks)
pub const SLOT_CLASSES: usize = 20;

/// Number of line-array classes (range bits 1..=10)
pub const LINE_CLASSES: usize = 10;

/// A buffer handed out by a [`Pool`]
#[derive(Debug)]
pub struct Pooled<T> {
    buf: Box<[T]>,
    class: Option<usize>,
}

impl<T> Pooled<T> {
    /// Size class the buffer came from, `None` when it bypassed the pool
    #[inline]
    pub fn class(&self) -> Option<usize> {
        self.class
    }
}

impl<T> Deref for Pooled<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        &self.buf
    }
}

impl<T> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.buf
    }
}

/// Free lists for fixed-length buffers of `T`, one list per class
#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<Vec<Box<[T]>>>,
    fill: T,
}

impl<T: Copy> Pool<T> {
    pub fn new(classes: usize, fill: T) -> Self {
        Self {
            free: (0..classes).map(|_| Vec::new()).collect(),
            fill,
        }
    }

    /// Take a buffer of `len` elements, every element reset to the fill value
    pub fn alloc(&mut self, class: Option<usize>, len: usize) -> Pooled<T> {
        let class = class.filter(|&c| c < self.free.len());
        let recycled = class.and_then(|c| self.free[c].pop());

        let buf = match recycled {
            Some(mut buf) if buf.len() == len => {
                buf.fill(self.fill);
                buf
            }
            _ => vec![self.fill; len].into_boxed_slice(),
        };

        Pooled { buf, class }
    }

    /// Return a buffer to the list it was allocated from
    pub fn free(&mut self, pooled: Pooled<T>) {
        if let Some(class) = pooled.class {
            self.free[class].push(pooled.buf);
        }
    }

    /// Number of buffers parked in `class`
    #[inline]
    pub fn available(&self, class: usize) -> usize {
        self.free.get(class).map_or(0, Vec::len)
    }
}

/// The two pools a routing table draws from
#[derive(Debug)]
pub struct Pools {
    slots: Pool<Slot>,
    lines: Pool<Line>,
}

impl Pools {
    pub fn new() -> Self {
        Self {
            slots: Pool::new(SLOT_CLASSES, Slot::EMPTY),
            lines: Pool::new(LINE_CLASSES, Line::default()),
        }
    }

    /// Allocate an empty slot array of `blocks` blocks
    #[inline]
    pub fn alloc_slots(&mut self, blocks: usize) -> Pooled<Slot> {
        debug_assert!(blocks > 0);
        let class = (blocks <= SLOT_CLASSES).then(|| blocks - 1);
        self.slots.alloc(class, blocks * BLOCK)
    }

    #[inline]
    pub fn free_slots(&mut self, slots: Pooled<Slot>) {
        self.slots.free(slots);
    }

    /// Allocate a line array for a model with `range_bits` range bits
    #[inline]
    pub fn alloc_lines(&mut self, range_bits: u8) -> Pooled<Line> {
        debug_assert!(range_bits > 0);
        let class = (range_bits as usize <= LINE_CLASSES).then(|| range_bits as usize - 1);
        self.lines.alloc(class, 1usize << range_bits)
    }

    #[inline]
    pub fn free_lines(&mut self, lines: Pooled<Line>) {
        self.lines.free(lines);
    }
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}
