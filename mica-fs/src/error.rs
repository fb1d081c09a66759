use core::fmt;

pub type Result<T> = core::result::Result<T, FsError>;

/// Every failure an engine call can report to the driver.
///
/// Block device failures are not represented here: a device that cannot
/// complete a transfer panics, matching the fatal-abort contract of the
/// storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No free block, or not enough free blocks for the whole request.
    Alloc,
    /// Name collision among the siblings of one folder.
    Duplicate,
    /// Path does not resolve to a registry entry.
    NotFound,
    /// Folder still has children.
    NotEmpty,
    /// Permission or open-state violation.
    Access,
    /// Uncategorized failure while writing content.
    Write,
    /// Uncategorized failure while reading content.
    Read,
    /// Entry is held open by some process.
    InUse,
    /// Open-policy violation: the entry is already open.
    Open,
    /// Irrecoverable inconsistency (bad magic, corrupt tag, bad geometry).
    System,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::Alloc => "out of free blocks",
            FsError::Duplicate => "name already exists in folder",
            FsError::NotFound => "no such file or folder",
            FsError::NotEmpty => "folder is not empty",
            FsError::Access => "access denied",
            FsError::Write => "write failed",
            FsError::Read => "read failed",
            FsError::InUse => "file is in use",
            FsError::Open => "file is already open",
            FsError::System => "volume is inconsistent",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for FsError {}
