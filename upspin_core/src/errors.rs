//! The error taxonomy shared by every crate in the workspace.
//!
//! An [`Error`] carries an operation name, the path or user it concerns, a
//! [`Kind`] classifying it, and an optional wrapped cause. Nested errors of
//! the same kind/path/user have the redundant inner fields cleared at
//! construction so the rendered chain stays legible.

use std::fmt;

use crate::entry::DirEntry;
use crate::path::{PathName, UserName};

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`]. The set is closed; every failure the
/// workspace surfaces maps onto one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// The operation or its arguments are malformed.
    Invalid,
    /// The user is known and explicitly denied.
    Permission,
    /// Existence of the item is withheld from this user.
    Private,
    /// The item already exists.
    Exist,
    /// The item does not exist.
    NotExist,
    /// The item is a directory where a file was expected.
    IsDir,
    /// The item is not a directory where one was expected.
    NotDir,
    /// A directory that must be empty is not.
    NotEmpty,
    /// Storage, network or disk failure.
    IO,
    /// An internal invariant was broken.
    Internal,
    /// Control-flow sentinel: the path crossed a link. Consumed by the
    /// client's resolver; never shown to end users.
    FollowLink,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Invalid => "invalid operation",
            Kind::Permission => "permission denied",
            Kind::Private => "existence not disclosed",
            Kind::Exist => "item already exists",
            Kind::NotExist => "item does not exist",
            Kind::IsDir => "item is a directory",
            Kind::NotDir => "item is not a directory",
            Kind::NotEmpty => "directory not empty",
            Kind::IO => "I/O error",
            Kind::Internal => "internal inconsistency",
            Kind::FollowLink => "link redirection",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wrapped cause: either another taxonomy error, a plain message, or a
/// foreign error from a lower layer.
#[derive(Debug)]
pub enum Cause {
    Error(Box<Error>),
    Str(String),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Default)]
pub struct Error {
    pub op: Option<String>,
    pub path: Option<PathName>,
    pub user: Option<UserName>,
    pub kind: Option<Kind>,
    pub cause: Option<Cause>,
    /// Set only for `Kind::FollowLink`: the link entry to substitute.
    link_entry: Option<Box<DirEntry>>,
}

impl Error {
    pub fn new(kind: Kind) -> Self {
        Error {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// The `FollowLink` sentinel, carrying the link entry that was crossed.
    pub fn follow_link(entry: DirEntry) -> Self {
        Error {
            kind: Some(Kind::FollowLink),
            link_entry: Some(Box::new(entry)),
            ..Default::default()
        }
    }

    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn path(mut self, path: impl Into<PathName>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<UserName>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Wraps `cause`, clearing inner fields this error already states.
    pub fn cause(mut self, cause: Error) -> Self {
        let mut inner = cause;
        if inner.kind == self.kind {
            inner.kind = None;
        }
        if inner.path == self.path {
            inner.path = None;
        }
        if inner.user == self.user {
            inner.user = None;
        }
        if self.kind.is_none() {
            // Promote the innermost classification so `is` works on the
            // outermost value.
            self.kind = inner.kind.take();
        }
        self.cause = Some(Cause::Error(Box::new(inner)));
        self
    }

    /// Wraps a plain message as the cause.
    pub fn msg(mut self, s: impl Into<String>) -> Self {
        self.cause = Some(Cause::Str(s.into()));
        self
    }

    /// Wraps a foreign error as the cause.
    pub fn with(mut self, err: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Cause::Other(Box::new(err)));
        self
    }

    /// Attributes this error to `op`: sets the field when free, otherwise
    /// wraps a new layer so the inner operation stays visible.
    pub fn in_op(self, op: impl Into<String>) -> Self {
        if self.op.is_some() {
            Error::default().op(op).cause(self)
        } else {
            self.op(op)
        }
    }

    /// The effective kind, walking wrapped causes when unset here.
    pub fn kind(&self) -> Option<Kind> {
        if self.kind.is_some() {
            return self.kind;
        }
        match &self.cause {
            Some(Cause::Error(inner)) => inner.kind(),
            _ => None,
        }
    }

    pub fn is(&self, kind: Kind) -> bool {
        self.kind() == Some(kind)
    }

    /// The link entry transported by a `FollowLink` sentinel.
    pub fn link(&self) -> Option<&DirEntry> {
        self.link_entry.as_deref()
    }

    pub fn into_link(self) -> Option<DirEntry> {
        self.link_entry.map(|b| *b)
    }

    fn fmt_at(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let mut wrote = false;
        let sep = |f: &mut fmt::Formatter<'_>, wrote: &mut bool| -> fmt::Result {
            if *wrote {
                f.write_str(": ")?;
            }
            *wrote = true;
            Ok(())
        };
        if let Some(op) = &self.op {
            sep(f, &mut wrote)?;
            f.write_str(op)?;
        }
        if let Some(path) = &self.path {
            sep(f, &mut wrote)?;
            f.write_str(path)?;
        } else if let Some(user) = &self.user {
            sep(f, &mut wrote)?;
            f.write_str(user)?;
        }
        if let Some(kind) = self.kind {
            sep(f, &mut wrote)?;
            f.write_str(kind.as_str())?;
        }
        if let Some(cause) = &self.cause {
            if wrote {
                f.write_str(":")?;
            }
            writeln!(f)?;
            for _ in 0..=depth {
                f.write_str("\t")?;
            }
            match cause {
                Cause::Error(inner) => inner.fmt_at(f, depth + 1)?,
                Cause::Str(s) => f.write_str(s)?,
                Cause::Other(err) => write!(f, "{err}")?,
            }
        } else if !wrote {
            f.write_str("no error")?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_at(f, 0)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(Cause::Error(inner)) => Some(inner.as_ref()),
            Some(Cause::Other(err)) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => Kind::NotExist,
            std::io::ErrorKind::AlreadyExists => Kind::Exist,
            std::io::ErrorKind::PermissionDenied => Kind::Permission,
            _ => Kind::IO,
        };
        Error::new(kind).with(err)
    }
}
