//! Open-time options for named IPC objects.
//!
//! The open mode is an enum rather than a bit set, so the mutually
//! exclusive combinations a flags integer would allow (create-only +
//! open-only, for example) cannot be expressed at all.

/// How an open call resolves against an existing or missing object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Attach to an existing object; fail with `DoesNotExist` if the name
    /// is missing.
    OpenOnly,
    /// Bring a new object into existence; fail with `AlreadyExists` if the
    /// name is taken.
    CreateOnly,
    /// Attach if the name exists, create it otherwise.
    OpenOrCreate,
}

/// Open mode plus the optional modifiers that combine with it.
///
/// `truncate` resets an existing object's contents on open; the mutex
/// wrappers never pass it, because an opener must not clobber shared state
/// another process initialized. `non_block` is accepted for parity with
/// stream-like IPC objects and is ignored by everything in this crate.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    mode: OpenMode,
    truncate: bool,
    non_block: bool,
}

impl OpenFlags {
    /// Open an existing object only.
    #[must_use]
    pub const fn open_only() -> Self {
        Self::new(OpenMode::OpenOnly)
    }

    /// Create a new object only.
    #[must_use]
    pub const fn create_only() -> Self {
        Self::new(OpenMode::CreateOnly)
    }

    /// Open the object, creating it if missing.
    #[must_use]
    pub const fn open_or_create() -> Self {
        Self::new(OpenMode::OpenOrCreate)
    }

    const fn new(mode: OpenMode) -> Self {
        Self {
            mode,
            truncate: false,
            non_block: false,
        }
    }

    /// Requests truncation of an existing object's contents on open.
    #[must_use]
    pub const fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Requests non-blocking operation where the object kind supports it.
    /// Shared memory objects and mutexes ignore this.
    #[must_use]
    pub const fn non_block(mut self, non_block: bool) -> Self {
        self.non_block = non_block;
        self
    }

    /// The open mode this set of flags resolves to.
    #[must_use]
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether truncation was requested.
    #[must_use]
    pub const fn is_truncate(&self) -> bool {
        self.truncate
    }

    /// Whether non-blocking operation was requested.
    #[must_use]
    pub const fn is_non_block(&self) -> bool {
        self.non_block
    }
}
