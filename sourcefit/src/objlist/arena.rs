//! Pixel arena with intrusive singly linked chains.
//!
//! Every detection owns one chain of [`PixelRecord`]s threaded through the
//! `next` index. Records are addressed by index, never by reference, so the
//! backing vector is free to relocate when it grows.

use crate::error::Result;

/// Chain terminator.
pub const END_OF_CHAIN: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRecord {
    pub x: i32,
    pub y: i32,
    pub value: f32,
    /// Value of the smoothed image when detection ran on a filtered raster.
    pub filtered: Option<f32>,
    pub next: i32,
}

impl PixelRecord {
    pub fn new(x: i32, y: i32, value: f32) -> Self {
        Self {
            x,
            y,
            value,
            filtered: None,
            next: END_OF_CHAIN,
        }
    }

    /// Value used for thresholding: the filtered one if present.
    #[inline]
    pub fn detection_value(&self) -> f32 {
        self.filtered.unwrap_or(self.value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PixelArena {
    records: Vec<PixelRecord>,
}

impl PixelArena {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn get(&self, index: i32) -> &PixelRecord {
        &self.records[index as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, index: i32) -> &mut PixelRecord {
        &mut self.records[index as usize]
    }

    /// Reserves room for `additional` records without committing any.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.records.try_reserve(additional)?;
        Ok(())
    }

    /// Appends a record and returns its index.
    pub fn push(&mut self, record: PixelRecord) -> Result<i32> {
        self.records.try_reserve(1)?;
        let index = self.records.len() as i32;
        self.records.push(record);
        Ok(index)
    }

    /// Appends the chain starting at `head` in `source`, relinked to the new
    /// offsets. Returns the new `(head, tail)`. Room must have been reserved.
    pub(crate) fn append_chain(&mut self, source: &PixelArena, head: i32) -> (i32, i32) {
        let new_head = self.records.len() as i32;
        let mut tail = END_OF_CHAIN;
        for (_, record) in source.chain(head) {
            let index = self.records.len() as i32;
            if tail != END_OF_CHAIN {
                self.records[tail as usize].next = index;
            }
            self.records.push(PixelRecord {
                next: END_OF_CHAIN,
                ..*record
            });
            tail = index;
        }
        if tail == END_OF_CHAIN {
            (END_OF_CHAIN, END_OF_CHAIN)
        } else {
            (new_head, tail)
        }
    }

    /// Links chain `(head2, tail2)` after `tail1`.
    #[inline]
    pub(crate) fn link(&mut self, tail1: i32, head2: i32) {
        self.records[tail1 as usize].next = head2;
    }

    pub fn chain(&self, head: i32) -> ChainIter<'_> {
        ChainIter {
            arena: self,
            cursor: head,
        }
    }

    pub fn shrink_to_fit(&mut self) {
        self.records.shrink_to_fit();
    }
}

/// Iterator over `(index, record)` pairs of one chain.
pub struct ChainIter<'a> {
    arena: &'a PixelArena,
    cursor: i32,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (i32, &'a PixelRecord);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == END_OF_CHAIN {
            return None;
        }
        let index = self.cursor;
        let record = self.arena.get(index);
        self.cursor = record.next;
        Some((index, record))
    }
}
