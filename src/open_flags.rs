//! Open flags and access modes as carried by OPEN/CREATE requests.

use std::fmt;
use std::fmt::Formatter;
use std::fmt::LowerHex;
use std::fmt::UpperHex;

/// How the file should be opened: read-only, write-only, or read-write.
/// The adapter keeps at most one daemon handle per node and access mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    /// Open file for reading only.
    O_RDONLY = libc::O_RDONLY,
    /// Open file for writing only.
    O_WRONLY = libc::O_WRONLY,
    /// Open file for reading and writing.
    O_RDWR = libc::O_RDWR,
}

impl OpenAccMode {
    pub fn readable(self) -> bool {
        !matches!(self, OpenAccMode::O_WRONLY)
    }

    pub fn writable(self) -> bool {
        !matches!(self, OpenAccMode::O_RDONLY)
    }
}

/// Open flags as passed to the open operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl LowerHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}

impl From<OpenAccMode> for OpenFlags {
    fn from(acc_mode: OpenAccMode) -> OpenFlags {
        OpenFlags(acc_mode as i32)
    }
}

impl OpenFlags {
    /// File access mode.
    pub fn acc_mode(self) -> OpenAccMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_RDONLY => OpenAccMode::O_RDONLY,
            libc::O_WRONLY => OpenAccMode::O_WRONLY,
            libc::O_RDWR => OpenAccMode::O_RDWR,
            _ => {
                // Impossible combination of flags.
                // Do not panic because the field is public.
                OpenAccMode::O_RDONLY
            }
        }
    }
}
