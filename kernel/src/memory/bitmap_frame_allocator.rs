use crate::{
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY},
    memory::error::MemoryError,
};

/// One bit per physical frame, set when the frame is in use.
///
/// The words live in physical memory picked by the frame allocator itself,
/// so the bitmap never depends on a heap.
pub struct FrameBitmap {
    bitmap: &'static mut [u64],
    total_frames: usize,
    used_frames: usize,
    /// No word below this index has a clear bit.
    lowest_free_entry: usize,
}

impl FrameBitmap {
    /// Builds a bitmap over `total_frames` frames with every frame marked used.
    ///
    /// # Panics
    /// If `bitmap` has fewer than `total_frames` bits.
    pub fn new(bitmap: &'static mut [u64], total_frames: usize) -> Self {
        assert!(bitmap.len() * BITMAP_ENTRY_SIZE >= total_frames);
        bitmap.fill(FULL_BITMAP_ENTRY);
        Self {
            bitmap,
            total_frames,
            used_frames: total_frames,
            lowest_free_entry: 0,
        }
    }

    /// Words needed to track `total_frames` frames.
    pub const fn entries_for(total_frames: usize) -> usize {
        total_frames.div_ceil(BITMAP_ENTRY_SIZE)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames
    }

    /// Mark every frame wholly inside [base, base + length) as free.
    pub fn free_region(&mut self, base: u64, length: u64) {
        let start_frame = (base as usize).div_ceil(FRAME_SIZE);
        let end_frame = ((base + length) as usize / FRAME_SIZE).min(self.total_frames);
        for frame_index in start_frame..end_frame {
            if self.clear_bit(frame_index) {
                self.lowest_free_entry = self.lowest_free_entry.min(frame_index / BITMAP_ENTRY_SIZE);
            }
        }
    }

    /// Mark every frame touched by [base, base + length) as used.
    pub fn reserve_region(&mut self, base: u64, length: u64) {
        let start_frame = base as usize / FRAME_SIZE;
        let end_frame = ((base + length) as usize)
            .div_ceil(FRAME_SIZE)
            .min(self.total_frames);
        for frame_index in start_frame..end_frame {
            self.set_bit(frame_index);
        }
    }

    /// Check if frame is used. Frames past the end of memory count as used.
    pub fn is_frame_used(&self, frame_index: usize) -> bool {
        frame_index >= self.total_frames || self.is_bit_set(frame_index)
    }

    /// Claims the lowest free frame.
    pub fn allocate(&mut self) -> Option<usize> {
        for entry in self.lowest_free_entry..self.bitmap.len() {
            let word = self.bitmap[entry];
            if word == FULL_BITMAP_ENTRY {
                continue;
            }

            let frame_index = entry * BITMAP_ENTRY_SIZE + (!word).trailing_zeros() as usize;
            if frame_index >= self.total_frames {
                break;
            }

            self.set_bit(frame_index);
            self.lowest_free_entry = entry;
            return Some(frame_index);
        }

        self.lowest_free_entry = self.bitmap.len();
        None
    }

    /// Claims `count` consecutive free frames, starting the search at `from`.
    pub fn allocate_contiguous(&mut self, count: usize, from: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }

        let mut run_start = from;
        let mut run_length = 0;
        for frame_index in from..self.total_frames {
            if self.is_bit_set(frame_index) {
                run_length = 0;
                run_start = frame_index + 1;
                continue;
            }

            run_length += 1;
            if run_length == count {
                for claimed in run_start..run_start + count {
                    self.set_bit(claimed);
                }
                return Some(run_start);
            }
        }

        None
    }

    /// Returns a frame to the pool.
    pub fn release(&mut self, frame_index: usize) -> Result<(), MemoryError> {
        if frame_index >= self.total_frames {
            return Err(MemoryError::InvalidFrame);
        }
        if !self.clear_bit(frame_index) {
            return Err(MemoryError::InvalidFree);
        }

        self.lowest_free_entry = self.lowest_free_entry.min(frame_index / BITMAP_ENTRY_SIZE);
        Ok(())
    }

    /// set a particular bit (1), returns whether it was clear before
    fn set_bit(&mut self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let entry = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[entry] & mask != 0 {
            return false;
        }

        self.bitmap[entry] |= mask;
        self.used_frames += 1;
        true
    }

    /// clear a particular bit (0), returns whether it was set before
    fn clear_bit(&mut self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let entry = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[entry] & mask == 0 {
            return false;
        }

        self.bitmap[entry] &= !mask;
        self.used_frames -= 1;
        true
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & mask != 0
    }
}
