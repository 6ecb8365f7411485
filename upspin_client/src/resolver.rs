//! The link-following resolver.
//!
//! Wraps every directory operation: dials the authoritative server for the
//! path's user, runs the operation, and on a `FollowLink` sentinel
//! substitutes the link target for the matched prefix and retries, up to
//! [`MAX_LINK_HOPS`] times. The caller's entry is passed by value, so the
//! original is never mutated; the evaluated entry is handed back alongside
//! the operation's result.

use std::future::Future;
use std::sync::Arc;

use upspin_core::dir::DirServer;
use upspin_core::entry::DirEntry;
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::path::Parsed;
use upspin_core::MAX_LINK_HOPS;

use crate::client::Client;

/// Operation results that can also be "the final link entry itself", for
/// callers that asked not to follow a link at the end of the path.
pub(crate) trait FromLink: Sized {
    fn from_link(entry: DirEntry) -> Self;
}

impl FromLink for DirEntry {
    fn from_link(entry: DirEntry) -> Self {
        entry
    }
}

impl FromLink for Option<DirEntry> {
    fn from_link(entry: DirEntry) -> Self {
        Some(entry)
    }
}

impl Client {
    /// Runs `f` against the authoritative directory server for
    /// `entry.name`, following link redirects. Returns the operation's
    /// result and the entry as finally evaluated (its name reflects all
    /// substitutions).
    pub(crate) async fn resolve<R, F, Fut>(
        &self,
        op: &'static str,
        entry: DirEntry,
        follow_final: bool,
        f: F,
    ) -> Result<(R, DirEntry)>
    where
        R: FromLink,
        F: Fn(Arc<dyn DirServer>, DirEntry) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let original = entry.name.clone();
        let mut entry = entry;
        let mut parsed = Parsed::parse(&entry.name)?;
        for _ in 0..MAX_LINK_HOPS {
            let dir = self.dir_for(&parsed).await.map_err(|e| e.in_op(op))?;
            match f(dir, entry.clone()).await {
                Ok(result) => return Ok((result, entry)),
                Err(err) if err.is(Kind::FollowLink) => {
                    let link = err.into_link().ok_or_else(|| {
                        Error::new(Kind::Internal)
                            .op(op)
                            .path(original.clone())
                            .msg("link sentinel without entry")
                    })?;
                    if link.name == parsed.path() && !follow_final {
                        return Ok((R::from_link(link), entry));
                    }
                    let rewritten = substitute_link(&parsed, &link)?;
                    entry.name = rewritten.path().to_string();
                    parsed = rewritten;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::new(Kind::IO).op(op).path(original).msg("link loop"))
    }

    /// The authoritative directory server for `parsed`'s user: the
    /// configured endpoint for the user themselves, otherwise each endpoint
    /// the key directory advertises, in order, until one dials.
    pub(crate) async fn dir_for(&self, parsed: &Parsed) -> Result<Arc<dyn DirServer>> {
        if parsed.user() == self.config().user_name
            && let Ok(dir) = self.dir_dialer().dial_dir(&self.config().dir_endpoint).await
        {
            return Ok(dir);
        }
        let record = self.keys().lookup(parsed.user()).await?;
        let mut first_err = None;
        for endpoint in &record.dirs {
            match self.dir_dialer().dial_dir(endpoint).await {
                Ok(dir) => return Ok(dir),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| {
            Error::new(Kind::NotExist)
                .user(parsed.user())
                .msg("user has no directory endpoints")
        }))
    }
}

// Replaces the prefix of `parsed` matched by `link` with the link target.
fn substitute_link(parsed: &Parsed, link: &DirEntry) -> Result<Parsed> {
    let link_parsed = Parsed::parse(&link.name)?;
    if link_parsed.user() != parsed.user() || link_parsed.nelem() > parsed.nelem() {
        return Err(Error::new(Kind::Internal)
            .path(parsed.path())
            .msg("link name is not a prefix of the path"));
    }
    for i in 0..link_parsed.nelem() {
        if link_parsed.elem(i) != parsed.elem(i) {
            return Err(Error::new(Kind::Internal)
                .path(parsed.path())
                .msg("link name is not a prefix of the path"));
        }
    }
    let target = Parsed::parse(&link.link)?;
    let mut result = target;
    for i in link_parsed.nelem()..parsed.nelem() {
        result = result.join(parsed.elem(i))?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use upspin_core::entry::{Attribute, Packing};

    use super::*;

    fn link(name: &str, target: &str) -> DirEntry {
        let mut e = DirEntry::new(name, Packing::Plain, "ann@example.com");
        e.attr = Attribute::Link;
        e.link = target.to_string();
        e
    }

    #[test]
    fn substitutes_prefix_for_target() {
        let parsed = Parsed::parse("ann@example.com/l/sub/file").unwrap();
        let l = link("ann@example.com/l", "ann@example.com/real/dir");
        let got = substitute_link(&parsed, &l).unwrap();
        assert_eq!(got.path(), "ann@example.com/real/dir/sub/file");
    }

    #[test]
    fn whole_path_link_substitutes_fully() {
        let parsed = Parsed::parse("ann@example.com/l").unwrap();
        let l = link("ann@example.com/l", "bob@example.com/elsewhere");
        let got = substitute_link(&parsed, &l).unwrap();
        assert_eq!(got.path(), "bob@example.com/elsewhere");
    }

    #[test]
    fn rejects_non_prefix_links() {
        let parsed = Parsed::parse("ann@example.com/a/b").unwrap();
        let l = link("ann@example.com/x", "ann@example.com/y");
        assert!(substitute_link(&parsed, &l).is_err());
        let l = link("ann@example.com/a/b/c", "ann@example.com/y");
        assert!(substitute_link(&parsed, &l).is_err());
    }

    #[test]
    fn target_is_canonicalized() {
        let parsed = Parsed::parse("ann@example.com/l/f").unwrap();
        let l = link("ann@example.com/l", "ann@example.com/d/../e");
        let got = substitute_link(&parsed, &l).unwrap();
        assert_eq!(got.path(), "ann@example.com/e/f");
    }
}
