//! # Session state
//!
//! Who is calling, and what they hold open. The driver supplies a [`Ctx`]
//! with every request; the engine keeps one record per process that has
//! files open (or has moved its current directory), and drops the record
//! once its open list empties.

use alloc::vec::Vec;

use enumflags2::BitFlags;

use crate::layout::AccessFlag;
use crate::registry::Handle;
use crate::{FsError, Result};

/// Caller identity, forwarded by the driver with every request.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// POSIX-shaped permission mask applied to created entries.
    pub umask: u16,
}

/// One open file of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub handle: Handle,
    /// Access granted at open time; later reads and writes may not
    /// exceed it.
    pub granted: BitFlags<AccessFlag>,
}

struct Process {
    pid: u32,
    open_files: Vec<OpenFile>,
    cwd: Handle,
}

pub struct ProcessTable {
    processes: Vec<Process>,
    root: Handle,
}

impl ProcessTable {
    pub fn new(root: Handle) -> Self {
        Self {
            processes: Vec::new(),
            root,
        }
    }

    fn find(&self, pid: u32) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    fn ensure(&mut self, pid: u32) -> &mut Process {
        if let Some(at) = self.processes.iter().position(|p| p.pid == pid) {
            return &mut self.processes[at];
        }
        self.processes.push(Process {
            pid,
            open_files: Vec::new(),
            cwd: self.root,
        });
        self.processes.last_mut().unwrap()
    }

    /// Current directory of `pid`; the root until the process changes it.
    pub fn cwd(&self, pid: u32) -> Handle {
        self.find(pid).map(|p| p.cwd).unwrap_or(self.root)
    }

    pub fn set_cwd(&mut self, pid: u32, cwd: Handle) {
        self.ensure(pid).cwd = cwd;
    }

    pub fn open_file(&mut self, pid: u32, open: OpenFile) {
        self.ensure(pid).open_files.push(open);
    }

    /// Removes `handle` from the caller's open list. Absence is an access
    /// violation: a process may only close what it opened.
    pub fn close_file(&mut self, pid: u32, handle: Handle) -> Result<OpenFile> {
        let at = self
            .processes
            .iter()
            .position(|p| p.pid == pid)
            .ok_or(FsError::Access)?;
        let process = &mut self.processes[at];
        let slot = process
            .open_files
            .iter()
            .position(|o| o.handle == handle)
            .ok_or(FsError::Access)?;
        let open = process.open_files.remove(slot);
        if process.open_files.is_empty() {
            self.processes.remove(at);
        }
        Ok(open)
    }

    pub fn find_open(&self, pid: u32, handle: Handle) -> Option<&OpenFile> {
        self.find(pid)?.open_files.iter().find(|o| o.handle == handle)
    }

    /// Whether `pid` holds the descriptor with `identifier` open.
    pub fn has_open(&self, pid: u32, identifier: u64) -> bool {
        self.find(pid)
            .map(|p| {
                p.open_files
                    .iter()
                    .any(|o| o.handle.identifier() == identifier)
            })
            .unwrap_or(false)
    }

    /// Whether any process holds the descriptor with `identifier` open.
    pub fn is_open_by_any(&self, identifier: u64) -> bool {
        self.processes.iter().any(|p| {
            p.open_files
                .iter()
                .any(|o| o.handle.identifier() == identifier)
        })
    }

    pub fn clear(&mut self) {
        self.processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Descriptor, DescriptorKind};
    use crate::registry::Registry;

    fn handles() -> (Handle, Handle) {
        let mut reg = Registry::new();
        let root = reg.insert(
            Descriptor::new(0, DescriptorKind::Folder, "/", 0, 0, 0, 0, 0),
            None,
        );
        let file = reg.insert(
            Descriptor::new(1, DescriptorKind::File, "f", 0, 0, 0, 1, 0),
            Some(root),
        );
        (root, file)
    }

    #[test]
    fn open_close_round_trip() {
        let (root, file) = handles();
        let mut table = ProcessTable::new(root);

        table.open_file(
            7,
            OpenFile {
                handle: file,
                granted: AccessFlag::Read.into(),
            },
        );
        assert!(table.has_open(7, 1));
        assert!(table.is_open_by_any(1));
        assert!(!table.has_open(8, 1));

        let open = table.close_file(7, file).unwrap();
        assert_eq!(open.granted, BitFlags::from(AccessFlag::Read));
        assert!(!table.is_open_by_any(1));
    }

    #[test]
    fn closing_anothers_handle_is_access_error() {
        let (root, file) = handles();
        let mut table = ProcessTable::new(root);
        table.open_file(
            7,
            OpenFile {
                handle: file,
                granted: AccessFlag::Read.into(),
            },
        );
        assert_eq!(table.close_file(8, file), Err(FsError::Access));
        assert_eq!(
            table.close_file(7, file).map(|o| o.handle),
            Ok(file)
        );
        // second close: the record is gone
        assert_eq!(table.close_file(7, file), Err(FsError::Access));
    }

    #[test]
    fn cwd_defaults_to_root_and_survives_opens() {
        let (root, file) = handles();
        let mut table = ProcessTable::new(root);
        assert_eq!(table.cwd(9), root);
        table.set_cwd(9, file);
        assert_eq!(table.cwd(9), file);
        assert_eq!(table.cwd(10), root);
    }
}
