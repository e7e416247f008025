//! Detection lists backed by a pixel arena.
//!
//! An [`ObjectList`] owns a dynamic array of [`Detection`]s plus one
//! [`PixelArena`] holding their pixel chains. Detections move between lists
//! by value; their chains are copied into the destination arena and relinked
//! to the new offsets.
//!
//! Capacity of the detection array is managed in fixed increments of
//! [`OBJLIST_CAPACITY_STEP`]: it grows by one step when full, shrinks by a
//! step once usage falls more than a step below capacity, and is released
//! outright when the last detection leaves.

mod arena;
mod detection;

#[cfg(test)]
mod tests;

pub use arena::{ChainIter, PixelArena, PixelRecord, END_OF_CHAIN};
pub use detection::{Detection, DetectionFlags};

use crate::constants::OBJLIST_CAPACITY_STEP;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    detections: Vec<Detection>,
    arena: PixelArena,
}

impl ObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.detections.capacity()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &Detection {
        &self.detections[index]
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> &mut Detection {
        &mut self.detections[index]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Detection> {
        self.detections.iter_mut()
    }

    pub fn arena(&self) -> &PixelArena {
        &self.arena
    }

    pub(crate) fn arena_mut(&mut self) -> &mut PixelArena {
        &mut self.arena
    }

    /// Pixel chain of a detection of this list.
    pub fn pixels<'a>(&'a self, detection: &Detection) -> ChainIter<'a> {
        self.arena.chain(detection.head)
    }

    /// Reruns the preanalysis of detection `index` over its chain.
    pub fn preanalyse(&mut self, index: usize) {
        self.detections[index].preanalyse(&self.arena);
    }

    /// Sum of member pixel counts.
    pub fn total_pixels(&self) -> usize {
        self.detections.iter().map(|d| d.npix).sum()
    }

    /// Appends a copy of `detection`. When `source` is given and the
    /// detection owns pixels, its chain is copied from `source` and relinked.
    ///
    /// Both the detection slot and the arena room are reserved before
    /// anything is committed: on allocation failure the list is unchanged.
    pub fn add(&mut self, detection: Detection, source: Option<&PixelArena>) -> Result<usize> {
        let chain_len = match source {
            Some(_) if detection.has_pixels() => detection.npix,
            _ => 0,
        };
        self.reserve_slot(chain_len)?;
        Ok(self.commit(detection, source))
    }

    /// Removes the detection at `index`, moving the last detection into its
    /// slot. Pixel records stay in the arena.
    ///
    /// # Panics
    /// Panics if `index` is out of range, including on an empty list.
    pub fn remove(&mut self, index: usize) -> Detection {
        assert!(
            index < self.detections.len(),
            "remove index {} out of range for {} detections",
            index,
            self.detections.len()
        );
        let detection = self.detections.swap_remove(index);
        let len = self.detections.len();
        let capacity = self.detections.capacity();
        if len == 0 {
            self.detections = Vec::new();
        } else if capacity > OBJLIST_CAPACITY_STEP && capacity - OBJLIST_CAPACITY_STEP > len {
            self.detections.shrink_to(capacity - OBJLIST_CAPACITY_STEP);
        }
        detection
    }

    /// Moves the detection at `index` into `dst`. If `dst` cannot grow, the
    /// source list is left untouched.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn move_to(&mut self, index: usize, dst: &mut ObjectList) -> Result<usize> {
        let npix = self.detections[index].npix;
        dst.reserve_slot(npix)?;
        let detection = self.remove(index);
        Ok(dst.commit(detection, Some(&self.arena)))
    }

    /// Moves every detection of blend group `blend` into a new list.
    pub fn extract_blend(&mut self, blend: u32) -> Result<ObjectList> {
        let mut group = ObjectList::new();
        let mut index = self.detections.len();
        while index > 0 {
            index -= 1;
            if self.detections[index].blend == blend {
                self.move_to(index, &mut group)?;
            }
        }
        Ok(group)
    }

    /// Releases spare capacity of both arrays.
    pub fn shrink_to_fit(&mut self) {
        if self.detections.is_empty() {
            self.detections = Vec::new();
        } else {
            self.detections.shrink_to_fit();
        }
        self.arena.shrink_to_fit();
    }

    fn reserve_slot(&mut self, chain_len: usize) -> Result<()> {
        if self.detections.len() == self.detections.capacity() {
            self.detections.try_reserve_exact(OBJLIST_CAPACITY_STEP)?;
        }
        if chain_len > 0 {
            self.arena.reserve(chain_len)?;
        }
        Ok(())
    }

    fn commit(&mut self, mut detection: Detection, source: Option<&PixelArena>) -> usize {
        if let Some(source) = source {
            if detection.has_pixels() {
                let (head, tail) = self.arena.append_chain(source, detection.head);
                detection.head = head;
                detection.tail = tail;
            }
        }
        self.detections.push(detection);
        self.detections.len() - 1
    }
}

impl<'a> IntoIterator for &'a ObjectList {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}
