//! Access and Group files.
//!
//! An `Access` file grants rights to users and groups for the subtree it
//! sits in; the nearest one up the path governs an operation. A Group file
//! (`user@domain/Group/<name>`) enumerates users and other groups.
//!
//! Both grammars are line oriented: LF separated, `#` starts a comment,
//! `\` at end of line continues it. An Access line is
//! `right[, right]*: user[, user]*` with
//! `right ∈ {r|read, l|list, w|write, c|create, d|delete, *}`.
//! Malformed content must make the `put` of the file fail `Invalid`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Error, Kind, Result};
use crate::path::{parse_user, Parsed, PathName, UserName};

/// Base name of every access file.
pub const ACCESS_FILE: &str = "Access";
/// First path element of every group file.
pub const GROUP_DIR: &str = "Group";
/// The keyword granting a right to any authenticated user.
pub const ALL_USERS: &str = "all";

/// How long parsed Group files stay cached.
const GROUP_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Right {
    Read,
    List,
    Write,
    Create,
    Delete,
}

pub const ALL_RIGHTS: [Right; 5] = [
    Right::Read,
    Right::List,
    Right::Write,
    Right::Create,
    Right::Delete,
];

impl Right {
    fn index(self) -> usize {
        match self {
            Right::Read => 0,
            Right::List => 1,
            Right::Write => 2,
            Right::Create => 3,
            Right::Delete => 4,
        }
    }
}

/// One name on the right-hand side of a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A concrete user.
    User(UserName),
    /// The `all` keyword.
    All,
    /// A group file, by canonical path.
    Group(PathName),
}

/// Reports whether `parsed` names an Access file.
pub fn is_access_file(parsed: &Parsed) -> bool {
    parsed.nelem() > 0 && parsed.base() == ACCESS_FILE
}

/// Reports whether `parsed` names a file inside a Group directory.
pub fn is_group_file(parsed: &Parsed) -> bool {
    parsed.nelem() >= 2 && parsed.elem(0) == GROUP_DIR
}

/// A parsed Access file.
#[derive(Debug, Clone)]
pub struct Access {
    parsed: Parsed,
    grants: [Vec<Principal>; 5],
}

/// Outcome of expanding the users for a right: either the flat user list,
/// or the group files that must be fetched into the cache first.
#[derive(Debug)]
pub enum UsersResult {
    Users(Vec<UserName>),
    NeedGroups(Vec<PathName>),
}

impl Access {
    /// Parses the contents of the Access file stored at `name`.
    pub fn parse(name: &str, data: &[u8]) -> Result<Access> {
        let parsed = Parsed::parse(name)?;
        if !is_access_file(&parsed) {
            return Err(Error::new(Kind::Invalid)
                .path(name)
                .msg("not an Access file"));
        }
        let mut grants: [Vec<Principal>; 5] = Default::default();
        for line in logical_lines(name, data)? {
            let (line_no, text) = line;
            let invalid = |why: String| {
                Error::new(Kind::Invalid)
                    .path(name)
                    .msg(format!("line {line_no}: {why}"))
            };
            let colon = text
                .find(':')
                .ok_or_else(|| invalid("no ':' on line".to_string()))?;
            let (rights_part, users_part) = (&text[..colon], &text[colon + 1..]);

            let mut rights = Vec::new();
            for token in rights_part.split(',') {
                let token = token.trim().to_ascii_lowercase();
                match token.as_str() {
                    "r" | "read" => rights.push(Right::Read),
                    "l" | "list" => rights.push(Right::List),
                    "w" | "write" => rights.push(Right::Write),
                    "c" | "create" => rights.push(Right::Create),
                    "d" | "delete" => rights.push(Right::Delete),
                    "*" => rights.extend(ALL_RIGHTS),
                    _ => return Err(invalid(format!("invalid right: {token:?}"))),
                }
            }

            let mut principals = Vec::new();
            for token in users_part.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                principals.push(parse_principal(parsed.user(), token).map_err(|e| {
                    invalid(format!("bad user or group {token:?}")).cause(e)
                })?);
            }
            if principals.is_empty() {
                return Err(invalid("no users granted".to_string()));
            }
            for right in rights {
                grants[right.index()].extend(principals.iter().cloned());
            }
        }
        Ok(Access { parsed, grants })
    }

    /// The canonical path of the Access file itself.
    pub fn path(&self) -> &str {
        self.parsed.path()
    }

    /// The owner of the tree the Access file lives in.
    pub fn owner(&self) -> &str {
        self.parsed.user()
    }

    /// Expands the users granted `right`, following group references
    /// through `groups`. Groups not yet cached are reported back so the
    /// caller can fetch and [`GroupCache::add`] them, then retry.
    pub fn users(&self, right: Right, groups: &GroupCache) -> Result<UsersResult> {
        let mut out: Vec<UserName> = Vec::new();
        let mut seen_users: HashSet<UserName> = HashSet::new();
        let mut seen_groups: HashSet<PathName> = HashSet::new();
        let mut missing: Vec<PathName> = Vec::new();
        let mut queue: Vec<Principal> = self.grants[right.index()].clone();

        while let Some(principal) = queue.pop() {
            match principal {
                Principal::All => {
                    if seen_users.insert(ALL_USERS.to_string()) {
                        out.push(ALL_USERS.to_string());
                    }
                }
                Principal::User(user) => {
                    if seen_users.insert(user.clone()) {
                        out.push(user);
                    }
                }
                Principal::Group(path) => {
                    // A group referencing itself, directly or not, expands
                    // once and stops.
                    if !seen_groups.insert(path.clone()) {
                        continue;
                    }
                    match groups.get(&path) {
                        Some(members) => queue.extend(members.iter().cloned()),
                        None => missing.push(path),
                    }
                }
            }
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Ok(UsersResult::NeedGroups(missing));
        }
        out.sort();
        Ok(UsersResult::Users(out))
    }
}

/// Parses the contents of the Group file stored at `name`.
pub fn parse_group(name: &str, data: &[u8]) -> Result<Vec<Principal>> {
    let parsed = Parsed::parse(name)?;
    if !is_group_file(&parsed) {
        return Err(Error::new(Kind::Invalid)
            .path(name)
            .msg("not a Group file"));
    }
    let mut members = Vec::new();
    for (line_no, text) in logical_lines(name, data)? {
        for token in text.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            members.push(parse_principal(parsed.user(), token).map_err(|e| {
                Error::new(Kind::Invalid)
                    .path(name)
                    .msg(format!("line {line_no}: bad member {token:?}"))
                    .cause(e)
            })?);
        }
    }
    Ok(members)
}

/// TTL cache of parsed Group files, shared by a client.
#[derive(Clone)]
pub struct GroupCache {
    cache: moka::sync::Cache<PathName, Arc<Vec<Principal>>>,
}

impl std::fmt::Debug for GroupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl Default for GroupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupCache {
    pub fn new() -> GroupCache {
        GroupCache {
            cache: moka::sync::Cache::builder()
                .max_capacity(1000)
                .time_to_live(GROUP_CACHE_TTL)
                .build(),
        }
    }

    /// Parses group file contents and caches them under the canonical path.
    pub fn add(&self, name: &str, data: &[u8]) -> Result<()> {
        let canonical = Parsed::parse(name)?.path().to_string();
        let members = parse_group(&canonical, data)?;
        self.cache.insert(canonical, Arc::new(members));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Vec<Principal>>> {
        self.cache.get(name)
    }

    pub fn remove(&self, name: &str) {
        self.cache.invalidate(name);
    }
}

// One principal token: `user@domain`, `all`, an absolute group path, or a
// bare name meaning a group in `owner`'s tree.
fn parse_principal(owner: &str, token: &str) -> Result<Principal> {
    if token.eq_ignore_ascii_case(ALL_USERS) {
        return Ok(Principal::All);
    }
    if token.contains('/') {
        let parsed = Parsed::parse(token)?;
        if !is_group_file(&parsed) {
            return Err(Error::new(Kind::Invalid)
                .path(token)
                .msg("path on rights line is not a Group file"));
        }
        return Ok(Principal::Group(parsed.path().to_string()));
    }
    if token.contains('@') {
        parse_user(token)?;
        return Ok(Principal::User(token.to_string()));
    }
    // Bare name: a group in the owner's tree.
    let parsed = Parsed::parse(&format!("{owner}/{GROUP_DIR}/{token}"))?;
    Ok(Principal::Group(parsed.path().to_string()))
}

// Logical lines: comments stripped, blank lines dropped, `\` continuation
// applied. Yields (1-based line number, text).
fn logical_lines(name: &str, data: &[u8]) -> Result<Vec<(usize, String)>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::new(Kind::Invalid).path(name).msg("not UTF-8"))?;
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (i, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(j) => &raw[..j],
            None => raw,
        };
        let line = line.trim();
        let (continued, line) = match line.strip_suffix('\\') {
            Some(rest) => (true, rest.trim_end()),
            None => (false, line),
        };
        match pending.take() {
            Some((start, mut acc)) => {
                acc.push(' ');
                acc.push_str(line);
                if continued {
                    pending = Some((start, acc));
                } else if !acc.trim().is_empty() {
                    out.push((start, acc));
                }
            }
            None => {
                if continued {
                    pending = Some((i + 1, line.to_string()));
                } else if !line.is_empty() {
                    out.push((i + 1, line.to_string()));
                }
            }
        }
    }
    if let Some((start, acc)) = pending {
        if !acc.trim().is_empty() {
            out.push((start, acc));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "ann@example.com";

    fn access(data: &str) -> Result<Access> {
        Access::parse(&format!("{OWNER}/Access"), data.as_bytes())
    }

    #[test]
    fn parse_rights_and_users() {
        let a = access("r, l: bob@example.com, carol@example.com\nw,c,d: bob@example.com\n")
            .unwrap();
        let groups = GroupCache::new();
        match a.users(Right::Read, &groups).unwrap() {
            UsersResult::Users(users) => {
                assert_eq!(users, vec!["bob@example.com", "carol@example.com"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match a.users(Right::Delete, &groups).unwrap() {
            UsersResult::Users(users) => assert_eq!(users, vec!["bob@example.com"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn star_grants_all_rights() {
        let a = access("*: bob@example.com\n").unwrap();
        let groups = GroupCache::new();
        for right in ALL_RIGHTS {
            match a.users(right, &groups).unwrap() {
                UsersResult::Users(users) => assert_eq!(users, vec!["bob@example.com"]),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_right_is_invalid() {
        // "all" is a user keyword, never a right.
        let err = access("all:*").unwrap_err();
        assert!(err.is(Kind::Invalid));
    }

    #[test]
    fn comments_and_continuations() {
        let a = access("# header\nr: bob@example.com, \\\n   carol@example.com # trailing\n")
            .unwrap();
        let groups = GroupCache::new();
        match a.users(Right::Read, &groups).unwrap() {
            UsersResult::Users(users) => {
                assert_eq!(users, vec!["bob@example.com", "carol@example.com"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn group_expansion_and_cycles() {
        let a = access("r: friends\n").unwrap();
        let groups = GroupCache::new();
        let friends = format!("{OWNER}/Group/friends");
        let closer = format!("{OWNER}/Group/closer");

        match a.users(Right::Read, &groups).unwrap() {
            UsersResult::NeedGroups(need) => assert_eq!(need, vec![friends.clone()]),
            other => panic!("unexpected {other:?}"),
        }

        // friends includes closer; closer includes friends again (cycle).
        groups
            .add(&friends, b"bob@example.com\ncloser\n")
            .unwrap();
        groups
            .add(&closer, b"carol@example.com, friends\n")
            .unwrap();
        match a.users(Right::Read, &groups).unwrap() {
            UsersResult::Users(users) => {
                assert_eq!(users, vec!["bob@example.com", "carol@example.com"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn all_keyword_is_a_user() {
        let a = access("r: all\n").unwrap();
        let groups = GroupCache::new();
        match a.users(Right::Read, &groups).unwrap() {
            UsersResult::Users(users) => assert_eq!(users, vec![ALL_USERS]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn group_file_validation() {
        assert!(parse_group(&format!("{OWNER}/Group/x"), b"bob@example.com\n").is_ok());
        assert!(parse_group(&format!("{OWNER}/NotGroup/x"), b"bob@example.com\n").is_err());
        assert!(parse_group(&format!("{OWNER}/Group/x"), b"bad@user@name.com\n").is_err());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(access("no colon here\n").is_err());
        assert!(access("r:\n").is_err());
        assert!(access("r: bad@user@name.com\n").is_err());
    }
}
