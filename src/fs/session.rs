//! Per-slot cursor state for open files. Each directory slot
//! has one read and one write session; a handle is open in at
//! most the mode its session records.

use super::{DIR_SLOTS, SECTORS_PER_CLUSTER};

/// Mode requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Closed,
    Read,
    Write,
}

/// Cursor state of one open read or write session.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub mode: Mode,
    /// Offset into the scratch buffer, 0..=CLUSTER_SIZE.
    pub buffer_pos: usize,
    pub current_cluster: u16,
    /// Bytes moved through this session since open.
    pub transferred: u64,
    /// First device sector of `current_cluster`; cluster
    /// transfers start here.
    pub current_sector: usize,
}

impl Session {
    const CLOSED: Session = Session {
        mode: Mode::Closed,
        buffer_pos: 0,
        current_cluster: 0,
        transferred: 0,
        current_sector: 0,
    };

    fn opened(mode: Mode, first_cluster: u16) -> Self {
        Self {
            mode,
            buffer_pos: 0,
            current_cluster: first_cluster,
            transferred: 0,
            current_sector: first_cluster as usize * SECTORS_PER_CLUSTER,
        }
    }
}

#[derive(Debug)]
pub struct Sessions {
    read: [Session; DIR_SLOTS],
    write: [Session; DIR_SLOTS],
}

impl Sessions {
    pub fn new() -> Self {
        Self {
            read: [Session::CLOSED; DIR_SLOTS],
            write: [Session::CLOSED; DIR_SLOTS],
        }
    }

    pub fn read_session(&self, slot: usize) -> &Session {
        &self.read[slot]
    }

    pub fn read_session_mut(&mut self, slot: usize) -> &mut Session {
        &mut self.read[slot]
    }

    pub fn write_session(&self, slot: usize) -> &Session {
        &self.write[slot]
    }

    pub fn write_session_mut(&mut self, slot: usize) -> &mut Session {
        &mut self.write[slot]
    }

    pub fn open_read(&mut self, slot: usize, first_cluster: u16) {
        self.read[slot] = Session::opened(Mode::Read, first_cluster);
    }

    /// Opening for write resets both cursors of the slot: the
    /// file was just truncated, so any read progress on it is
    /// meaningless.
    pub fn open_write(&mut self, slot: usize, first_cluster: u16) {
        self.write[slot] = Session::opened(Mode::Write, first_cluster);
        self.read[slot] = Session::CLOSED;
    }

    /// Closes both sessions of `slot` and only of `slot`.
    pub fn close(&mut self, slot: usize) {
        self.read[slot] = Session::CLOSED;
        self.write[slot] = Session::CLOSED;
    }
}

#[test]
fn close_touches_a_single_slot() {
    let mut sessions = Sessions::new();
    sessions.open_write(4, 33);
    sessions.open_read(9, 35);
    sessions.close(4);
    assert_eq!(sessions.write_session(4).mode, Mode::Closed);
    assert_eq!(sessions.read_session(9).mode, Mode::Read);
}

#[test]
fn open_resets_the_cursor() {
    let mut sessions = Sessions::new();
    sessions.open_write(0, 33);
    {
        let s = sessions.write_session_mut(0);
        s.buffer_pos = 100;
        s.transferred = 100;
    }
    sessions.open_write(0, 40);
    let s = sessions.write_session(0);
    assert_eq!(s.buffer_pos, 0);
    assert_eq!(s.transferred, 0);
    assert_eq!(s.current_cluster, 40);
    assert_eq!(s.current_sector, 40 * SECTORS_PER_CLUSTER);
}
