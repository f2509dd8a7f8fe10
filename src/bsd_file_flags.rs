use bitflags::bitflags;

bitflags! {
    /// `chflags(2)` file flags, carried verbatim on the wire regardless of
    /// host platform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BsdFileFlags: u32 {
        /// Do not dump the file.
        const UF_NODUMP = 0x0000_0001;
        /// The file may not be changed.
        const UF_IMMUTABLE = 0x0000_0002;
        /// The file may only be appended to.
        const UF_APPEND = 0x0000_0004;
        /// The directory is opaque when viewed through a union stack.
        const UF_OPAQUE = 0x0000_0008;
        /// The file or directory is not intended to be displayed.
        const UF_HIDDEN = 0x0000_8000;
        /// The file has been archived.
        const SF_ARCHIVED = 0x0001_0000;
        /// The file may not be changed, even by the superuser.
        const SF_IMMUTABLE = 0x0002_0000;
        /// The file may only be appended to, even by the superuser.
        const SF_APPEND = 0x0004_0000;
    }
}
