//! Single-pass 8-connected component extraction (Lutz 1980).
//!
//! The scan walks the window top to bottom, left to right, keeping one row
//! of state: a marker per column telling the next row where runs start and
//! end, a stack of open-run records and a stack of "status of the run
//! below". Pixels above threshold are appended to the output arena as they
//! are met and spliced into the chain of the run they belong to, so no
//! label image is ever built.
//!
//! A sentinel column at the right edge and a sentinel row after the last one
//! force every open run to close before the scan ends.

#[cfg(test)]
mod tests;

use tracing::debug;

use crate::error::Result;
use crate::objlist::{Detection, DetectionFlags, ObjectList, PixelArena, PixelRecord, END_OF_CHAIN};
use crate::subimage::SubImage;

/// Detection threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Fixed level in image units.
    Absolute(f32),
    /// Multiple of the per-pixel noise sigma.
    Relative(f32),
}

impl Threshold {
    #[inline]
    fn level(self, variance: f32) -> f32 {
        match self {
            Threshold::Absolute(level) => level,
            Threshold::Relative(k) => k * variance.max(0.0).sqrt(),
        }
    }
}

/// Scanned rectangle in parent coordinates, `xmax`/`ymax` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanBounds {
    pub xmin: i32,
    pub xmax: i32,
    pub ymin: i32,
    pub ymax: i32,
}

impl ScanBounds {
    /// The whole window of `sub`.
    pub fn of(sub: &SubImage) -> Self {
        Self {
            xmin: sub.xmin(),
            xmax: sub.xmin() + sub.width() as i32,
            ymin: sub.ymin(),
            ymax: sub.ymin() + sub.height() as i32,
        }
    }

    /// Intersection with the window of `sub`.
    pub fn clamped_to(self, sub: &SubImage) -> Self {
        let full = Self::of(sub);
        Self {
            xmin: self.xmin.max(full.xmin),
            xmax: self.xmax.min(full.xmax).max(self.xmin.max(full.xmin)),
            ymin: self.ymin.max(full.ymin),
            ymax: self.ymax.min(full.ymax).max(self.ymin.max(full.ymin)),
        }
    }

    pub fn width(&self) -> usize {
        (self.xmax - self.xmin).max(0) as usize
    }

    pub fn height(&self) -> usize {
        (self.ymax - self.ymin).max(0) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    None,
    /// Start of a run, first one attached to its parent.
    Start,
    /// Start of a run sharing a parent with an earlier one.
    StartShared,
    /// End of a run that may still continue below.
    Pending,
    /// End of a fully closed run.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Complete,
    Incomplete,
    Object,
    NonObject,
}

/// Accumulated state of a run: pixel count, flags and chain ends.
#[derive(Debug, Clone, Copy)]
struct RunInfo {
    npix: usize,
    flags: DetectionFlags,
    head: i32,
    tail: i32,
}

impl RunInfo {
    const EMPTY: RunInfo = RunInfo {
        npix: 0,
        flags: DetectionFlags::empty(),
        head: END_OF_CHAIN,
        tail: END_OF_CHAIN,
    };
}

const UNKNOWN: i32 = -1;

/// Appends `other` to `into`, splicing the pixel chains.
fn merge(arena: &mut PixelArena, into: &mut RunInfo, other: &RunInfo) {
    into.npix += other.npix;
    into.flags |= other.flags;
    if into.head == END_OF_CHAIN {
        into.head = other.head;
        into.tail = other.tail;
    } else if other.tail != END_OF_CHAIN {
        arena.link(into.tail, other.head);
        into.tail = other.tail;
    }
}

fn scratch<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);
    Ok(v)
}

fn emit(list: &mut ObjectList, run: &RunInfo) -> Result<()> {
    let mut detection = Detection::from_chain(run.head, run.tail, run.npix, run.flags);
    detection.preanalyse(list.arena());
    let index = list.len() as u32;
    detection.number = index;
    detection.blend = index;
    list.add(detection, None)?;
    Ok(())
}

/// Extracts the 8-connected groups of pixels of `sub` above `threshold`
/// inside `bounds`.
///
/// Groups with fewer than `min_area` pixels are discarded. Groups touching
/// the edge of `bounds` are flagged [`DetectionFlags::TRUNCATED`]. Emitted
/// detections are preanalysed and get `number == blend == index`. When
/// `sub` carries a filtered raster the threshold applies to the filtered
/// values.
pub fn segment(
    sub: &SubImage,
    threshold: Threshold,
    bounds: ScanBounds,
    min_area: usize,
) -> Result<ObjectList> {
    let bounds = bounds.clamped_to(sub);
    let subw = bounds.width();
    let subh = bounds.height();
    let scansize = subw + 1;
    let x0 = (bounds.xmin - sub.xmin()) as usize;
    let y0 = (bounds.ymin - sub.ymin()) as usize;

    let mut info = scratch(scansize + 1, RunInfo::EMPTY)?;
    let mut store = scratch(scansize + 1, RunInfo::EMPTY)?;
    let mut marker = scratch(scansize + 1, Marker::None)?;
    let mut psstack = scratch(2 * scansize + 2, Status::Complete)?;
    let mut start = scratch(scansize + 1, UNKNOWN)?;
    let mut end = scratch(scansize + 1, 0usize)?;

    let mut list = ObjectList::new();
    list.arena_mut().reserve(subw * subh / 4)?;
    let filtered = sub.filtered();

    let mut co = 0usize;
    let mut pstop = 0usize;

    for yl in 0..=subh {
        let mut ps = Status::Complete;
        let mut cs = Status::NonObject;
        let row_flags = if yl == 0 || yl + 1 == subh {
            DetectionFlags::TRUNCATED
        } else {
            DetectionFlags::empty()
        };

        for xl in 0..=subw {
            let new_marker = std::mem::replace(&mut marker[xl], Marker::None);

            let mut current = None;
            if yl < subh && xl < subw {
                let (lx, ly) = (x0 + xl, y0 + yl);
                let dvalue = sub.detection_value(lx, ly);
                if dvalue > threshold.level(sub.detection_variance(lx, ly)) {
                    let mut flags = row_flags;
                    if xl == 0 || xl + 1 == subw {
                        flags |= DetectionFlags::TRUNCATED;
                    }
                    let index = list.arena_mut().push(PixelRecord {
                        filtered: filtered.map(|f| f[(lx, ly)]),
                        ..PixelRecord::new(
                            bounds.xmin + xl as i32,
                            bounds.ymin + yl as i32,
                            sub.image()[(lx, ly)],
                        )
                    })?;
                    current = Some(RunInfo {
                        npix: 1,
                        flags,
                        head: index,
                        tail: index,
                    });

                    if cs != Status::Object {
                        // Start of a segment.
                        cs = Status::Object;
                        if ps == Status::Object {
                            if start[co] == UNKNOWN {
                                marker[xl] = Marker::Start;
                                start[co] = xl as i32;
                            } else {
                                marker[xl] = Marker::StartShared;
                            }
                        } else {
                            psstack[pstop] = ps;
                            pstop += 1;
                            marker[xl] = Marker::Start;
                            co += 1;
                            start[co] = xl as i32;
                            ps = Status::Complete;
                            info[co] = RunInfo::EMPTY;
                        }
                    }
                }
            }

            match new_marker {
                Marker::None => {}
                Marker::Start => {
                    psstack[pstop] = ps;
                    pstop += 1;
                    if cs == Status::NonObject {
                        psstack[pstop] = Status::Complete;
                        pstop += 1;
                        co += 1;
                        info[co] = store[xl];
                        start[co] = UNKNOWN;
                    } else {
                        let below = store[xl];
                        merge(list.arena_mut(), &mut info[co], &below);
                    }
                    ps = Status::Object;
                }
                Marker::StartShared => {
                    if cs == Status::Object && ps == Status::Complete {
                        pstop -= 1;
                        let xl2 = start[co];
                        let top = info[co];
                        merge(list.arena_mut(), &mut info[co - 1], &top);
                        co -= 1;
                        if start[co] == UNKNOWN {
                            start[co] = xl2;
                        } else {
                            marker[xl2 as usize] = Marker::StartShared;
                        }
                    }
                    ps = Status::Object;
                }
                Marker::Pending => ps = Status::Incomplete,
                Marker::Closed => {
                    pstop -= 1;
                    ps = psstack[pstop];
                    if cs == Status::NonObject && ps == Status::Complete {
                        if start[co] == UNKNOWN {
                            if info[co].npix >= min_area {
                                emit(&mut list, &info[co])?;
                            }
                        } else {
                            marker[end[co]] = Marker::Closed;
                            store[start[co] as usize] = info[co];
                        }
                        co -= 1;
                        pstop -= 1;
                        ps = psstack[pstop];
                    }
                }
            }

            if let Some(current) = current {
                merge(list.arena_mut(), &mut info[co], &current);
            } else if cs == Status::Object {
                // End of a segment.
                cs = Status::NonObject;
                if ps != Status::Complete {
                    marker[xl] = Marker::Pending;
                    end[co] = xl;
                } else {
                    pstop -= 1;
                    ps = psstack[pstop];
                    marker[xl] = Marker::Closed;
                    store[start[co] as usize] = info[co];
                    co -= 1;
                }
            }
        }
    }

    list.shrink_to_fit();
    debug!(
        detections = list.len(),
        pixels = list.arena().len(),
        width = subw,
        height = subh,
        "segmentation done"
    );
    Ok(list)
}
