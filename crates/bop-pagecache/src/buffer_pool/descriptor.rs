//! Frame state.
//!
//! Each frame of the pool is in exactly one [`PageState`]. Only file-backed
//! states carry a [`FileFrame`], so page fields can't be read from a frame
//! that holds no page.

use crate::log::Lsn;
use crate::page::PageId;

/// Index of a frame in the pool arena.
pub type FrameId = usize;

/// Who asked for a page to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushClass {
    /// Frees replaceable frames at the LRU tail. Never waits for a latch.
    Eviction,
    /// Writes the oldest dirty pages so the checkpoint can advance.
    Checkpoint,
}

impl FlushClass {
    pub const ALL: [FlushClass; 2] = [FlushClass::Eviction, FlushClass::Checkpoint];

    pub fn index(self) -> usize {
        match self {
            FlushClass::Eviction => 0,
            FlushClass::Checkpoint => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushClass::Eviction => "eviction",
            FlushClass::Checkpoint => "checkpoint",
        }
    }
}

/// In-flight I/O on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoFix {
    #[default]
    None,
    Read,
    Write,
}

/// Fields of a frame that holds a tablespace page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFrame {
    pub id: PageId,
    pub io_fix: IoFix,
    pub buf_fix_count: u32,
    /// Class of the in-flight write, if any.
    pub flush_type: Option<FlushClass>,
    /// LSN of the first change since the last write; 0 when clean.
    pub oldest_modification: Lsn,
    pub newest_modification: Lsn,
    pub zip_size: Option<usize>,
    pub in_lru: bool,
    pub in_flush_list: bool,
    pub in_page_hash: bool,
}

impl FileFrame {
    pub fn new(id: PageId, zip_size: Option<usize>) -> Self {
        Self {
            id,
            io_fix: IoFix::None,
            buf_fix_count: 0,
            flush_type: None,
            oldest_modification: 0,
            newest_modification: 0,
            zip_size,
            in_lru: false,
            in_flush_list: false,
            in_page_hash: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.oldest_modification != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageState {
    /// On the free list.
    #[default]
    NotUsed,
    /// Taken off the free list, not yet assigned.
    ReadyForUse,
    /// Lent out as scratch memory.
    Memory,
    /// Uncompressed tablespace page.
    FilePage(FileFrame),
    /// Clean page of a compressed tablespace.
    ZipPage(FileFrame),
    /// Dirty page of a compressed tablespace.
    ZipDirty(FileFrame),
}

/// State of one frame, guarded by the frame's mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub frame: FrameId,
    pub state: PageState,
}

impl PageDescriptor {
    pub fn new(frame: FrameId) -> Self {
        Self {
            frame,
            state: PageState::NotUsed,
        }
    }

    pub fn file(&self) -> Option<&FileFrame> {
        match &self.state {
            PageState::FilePage(file) | PageState::ZipPage(file) | PageState::ZipDirty(file) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileFrame> {
        match &mut self.state {
            PageState::FilePage(file) | PageState::ZipPage(file) | PageState::ZipDirty(file) => Some(file),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<PageId> {
        self.file().map(|file| file.id)
    }

    /// Whether this frame holds `id`.
    pub fn holds(&self, id: PageId) -> bool {
        self.file().is_some_and(|file| file.id == id && file.in_page_hash)
    }

    pub fn is_dirty(&self) -> bool {
        self.file().is_some_and(FileFrame::is_dirty)
    }

    /// Assigns a page to a frame that was just taken for use.
    pub fn assign(&mut self, file: FileFrame) {
        debug_assert!(matches!(self.state, PageState::ReadyForUse));
        self.state = match file.zip_size {
            Some(_) => PageState::ZipPage(file),
            None => PageState::FilePage(file),
        };
    }

    /// Records a modification at `lsn`; returns true if the page was clean.
    pub fn note_modification(&mut self, lsn: Lsn) -> bool {
        let state = std::mem::take(&mut self.state);
        let (state, newly_dirty) = match state {
            PageState::ZipPage(mut file) => {
                file.oldest_modification = lsn;
                file.newest_modification = file.newest_modification.max(lsn);
                file.in_flush_list = true;
                (PageState::ZipDirty(file), true)
            }
            PageState::FilePage(mut file) | PageState::ZipDirty(mut file) if !file.is_dirty() => {
                file.oldest_modification = lsn;
                file.newest_modification = file.newest_modification.max(lsn);
                file.in_flush_list = true;
                (PageState::FilePage(file), true)
            }
            PageState::FilePage(mut file) => {
                file.newest_modification = file.newest_modification.max(lsn);
                (PageState::FilePage(file), false)
            }
            PageState::ZipDirty(mut file) => {
                file.newest_modification = file.newest_modification.max(lsn);
                (PageState::ZipDirty(file), false)
            }
            other => (other, false),
        };
        self.state = state;
        newly_dirty
    }

    /// Clears the dirty state after a successful write.
    pub fn note_written(&mut self) {
        let state = std::mem::take(&mut self.state);
        self.state = match state {
            PageState::ZipDirty(mut file) | PageState::ZipPage(mut file) => {
                file.oldest_modification = 0;
                file.in_flush_list = false;
                PageState::ZipPage(file)
            }
            PageState::FilePage(mut file) => {
                file.oldest_modification = 0;
                file.in_flush_list = false;
                PageState::FilePage(file)
            }
            other => other,
        };
    }

    /// Dirty, not under I/O and, for eviction, not fixed by anyone.
    pub fn ready_for_flush(&self, class: FlushClass) -> bool {
        self.file().is_some_and(|file| {
            file.is_dirty()
                && file.io_fix == IoFix::None
                && (class != FlushClass::Eviction || file.buf_fix_count == 0)
        })
    }

    /// Clean, not under I/O and not fixed: the frame may be reused.
    pub fn ready_for_replace(&self) -> bool {
        self.file().is_some_and(|file| {
            !file.is_dirty() && file.io_fix == IoFix::None && file.buf_fix_count == 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(zip_size: Option<usize>) -> PageDescriptor {
        let mut desc = PageDescriptor::new(3);
        desc.state = PageState::ReadyForUse;
        let mut file = FileFrame::new(PageId::new(1, 7), zip_size);
        file.in_page_hash = true;
        desc.assign(file);
        desc
    }

    #[test]
    fn modification_tracks_oldest_and_newest() {
        let mut desc = loaded(None);
        assert!(desc.note_modification(10));
        assert!(!desc.note_modification(20));
        let file = desc.file().expect("file page");
        assert_eq!((file.oldest_modification, file.newest_modification), (10, 20));

        desc.note_written();
        assert!(!desc.is_dirty());
        assert_eq!(desc.file().map(|f| f.newest_modification), Some(20));
    }

    #[test]
    fn compressed_pages_switch_between_clean_and_dirty_states() {
        let mut desc = loaded(Some(4096));
        assert!(matches!(desc.state, PageState::ZipPage(_)));
        desc.note_modification(5);
        assert!(matches!(desc.state, PageState::ZipDirty(_)));
        desc.note_written();
        assert!(matches!(desc.state, PageState::ZipPage(_)));
    }

    #[test]
    fn readiness_gates() {
        let mut desc = loaded(None);
        assert!(desc.ready_for_replace());
        assert!(!desc.ready_for_flush(FlushClass::Checkpoint));

        desc.note_modification(9);
        if let Some(file) = desc.file_mut() {
            file.buf_fix_count = 1;
        }
        assert!(desc.ready_for_flush(FlushClass::Checkpoint));
        assert!(!desc.ready_for_flush(FlushClass::Eviction));
        assert!(!desc.ready_for_replace());

        if let Some(file) = desc.file_mut() {
            file.buf_fix_count = 0;
            file.io_fix = IoFix::Write;
        }
        assert!(!desc.ready_for_flush(FlushClass::Eviction));
    }

    #[test]
    fn free_frames_hold_no_page() {
        let desc = PageDescriptor::new(0);
        assert_eq!(desc.id(), None);
        assert!(!desc.ready_for_replace());
        assert!(!desc.ready_for_flush(FlushClass::Checkpoint));
    }
}
