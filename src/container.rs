//! Ancestry chain of the object currently being scanned.
//!
//! # Invariants
//! - Frame storage is preallocated to `max_recursion + 1` and never grows.
//! - `depth()` equals the number of pushed frames, which equals the
//!   session's current recursion depth.
//! - `push` and `pop` must be balanced; `push` past capacity is refused,
//!   never a panic.
//!
//! # Design Notes
//! - Slot 0 is a permanent `Any` frame standing for "no container", so
//!   `parent_type()` is always defined.

use crate::filetype::FileType;

/// One level of nesting: the container whose children are being scanned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerFrame {
    pub file_type: FileType,
    /// Declared (or observed) size of the container.
    pub size: u64,
    /// Offset of the container within its backing storage.
    pub offset: u64,
}

/// Returned by [`ContainerStack::push`] when the stack is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthExceeded {
    pub max_depth: u32,
}

/// Fixed-capacity stack of container frames.
#[derive(Clone, Debug)]
pub struct ContainerStack {
    frames: Box<[ContainerFrame]>,
    depth: usize,
}

impl ContainerStack {
    pub fn new(max_depth: u32) -> Self {
        let cap = max_depth as usize + 1;
        Self {
            frames: vec![ContainerFrame::default(); cap].into_boxed_slice(),
            depth: 0,
        }
    }

    #[inline(always)]
    pub fn depth(&self) -> u32 {
        self.depth as u32
    }

    #[inline]
    pub fn max_depth(&self) -> u32 {
        (self.frames.len() - 1) as u32
    }

    /// Enter a container.
    pub fn push(&mut self, frame: ContainerFrame) -> Result<(), DepthExceeded> {
        let next = self.depth + 1;
        if next >= self.frames.len() {
            return Err(DepthExceeded {
                max_depth: self.max_depth(),
            });
        }
        self.frames[next] = frame;
        self.depth = next;
        Ok(())
    }

    /// Leave the innermost container.
    #[inline]
    pub fn pop(&mut self) -> Option<ContainerFrame> {
        if self.depth == 0 {
            debug_assert!(false, "container pop without matching push");
            return None;
        }
        let frame = self.frames[self.depth];
        self.frames[self.depth] = ContainerFrame::default();
        self.depth -= 1;
        Some(frame)
    }

    /// Innermost container, or the root `Any` frame.
    #[inline]
    pub fn current(&self) -> &ContainerFrame {
        &self.frames[self.depth]
    }

    /// Type of the immediate container of the object being scanned.
    #[inline]
    pub fn parent_type(&self) -> FileType {
        self.frames[self.depth].file_type
    }

    /// Frame `levels_up` above the innermost one (0 = innermost).
    pub fn ancestor(&self, levels_up: u32) -> Option<&ContainerFrame> {
        let idx = self.depth.checked_sub(levels_up as usize)?;
        (idx > 0).then(|| &self.frames[idx])
    }

    /// Retag the innermost frame (a handler learned a more precise type).
    pub fn set_current(&mut self, file_type: FileType, size: u64) {
        if self.depth == 0 {
            return;
        }
        let frame = &mut self.frames[self.depth];
        frame.file_type = file_type;
        frame.size = size;
    }

    /// Active frames, outermost first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ContainerFrame> + '_ {
        self.frames[1..=self.depth].iter()
    }

    pub fn contains(&self, file_type: FileType) -> bool {
        self.iter().any(|f| f.file_type == file_type)
    }
}
