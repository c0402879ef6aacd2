//! Users and groups as seen by the server engine.
//!
//! `Tauth`/`Tattach` name a user either by string or, under 9P2000.u, by
//! number. The engine resolves it through a `Users` service handed to the
//! server, so there is no process-wide user cache.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use nix::unistd;

use crate::{
    fcall::QId,
    utils::{Result, lock},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub id: u32,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub id: u32,
    /// Primary group first
    pub groups: Vec<Group>,
}

impl User {
    pub fn is_member(&self, gid: u32) -> bool {
        self.groups.iter().any(|g| g.id == gid)
    }
}

/// Lookup of users and groups by name or number
pub trait Users: Send + Sync {
    fn uid2user(&self, uid: u32) -> Option<User>;
    fn uname2user(&self, uname: &str) -> Option<User>;
    fn gid2group(&self, gid: u32) -> Option<Group>;
    fn gname2group(&self, gname: &str) -> Option<Group>;
}

/// Users and groups of the host, read from the passwd and group databases
///
/// Successful lookups are cached for the lifetime of the value.
#[derive(Default)]
pub struct OsUsers {
    users: Mutex<HashMap<u32, User>>,
    groups: Mutex<HashMap<u32, Group>>,
}

impl OsUsers {
    pub fn new() -> OsUsers {
        Default::default()
    }

    fn group_of(&self, g: unistd::Group) -> Group {
        let group = Group {
            name: g.name,
            id: g.gid.as_raw(),
            members: g.mem,
        };
        lock(&self.groups).insert(group.id, group.clone());
        group
    }

    fn user_of(&self, u: unistd::User) -> User {
        let groups = self.gid2group(u.gid.as_raw()).into_iter().collect();
        let user = User {
            name: u.name,
            id: u.uid.as_raw(),
            groups,
        };
        lock(&self.users).insert(user.id, user.clone());
        user
    }
}

impl Users for OsUsers {
    fn uid2user(&self, uid: u32) -> Option<User> {
        if let Some(u) = lock(&self.users).get(&uid) {
            return Some(u.clone());
        }
        let u = unistd::User::from_uid(unistd::Uid::from_raw(uid)).ok()??;
        Some(self.user_of(u))
    }

    fn uname2user(&self, uname: &str) -> Option<User> {
        if let Some(u) = lock(&self.users)
            .values()
            .find(|u| u.name == uname)
        {
            return Some(u.clone());
        }
        let u = unistd::User::from_name(uname).ok()??;
        Some(self.user_of(u))
    }

    fn gid2group(&self, gid: u32) -> Option<Group> {
        if let Some(g) = lock(&self.groups).get(&gid) {
            return Some(g.clone());
        }
        let g = unistd::Group::from_gid(unistd::Gid::from_raw(gid)).ok()??;
        Some(self.group_of(g))
    }

    fn gname2group(&self, gname: &str) -> Option<Group> {
        if let Some(g) = lock(&self.groups)
            .values()
            .find(|g| g.name == gname)
        {
            return Some(g.clone());
        }
        let g = unistd::Group::from_name(gname).ok()??;
        Some(self.group_of(g))
    }
}

/// A fixed table of users and groups
#[derive(Clone, Debug, Default)]
pub struct StaticUsers {
    users: Vec<User>,
    groups: Vec<Group>,
}

impl StaticUsers {
    pub fn new() -> StaticUsers {
        Default::default()
    }

    pub fn group(mut self, name: &str, id: u32) -> Self {
        self.groups.push(Group {
            name: name.to_owned(),
            id,
            members: Vec::new(),
        });
        self
    }

    /// Add a user whose primary group is `gid`, which must already be present
    pub fn user(mut self, name: &str, id: u32, gid: u32) -> Self {
        let mut groups = Vec::new();
        if let Some(g) = self.groups.iter_mut().find(|g| g.id == gid) {
            g.members.push(name.to_owned());
            groups.push(g.clone());
        }
        self.users.push(User {
            name: name.to_owned(),
            id,
            groups,
        });
        self
    }
}

impl Users for StaticUsers {
    fn uid2user(&self, uid: u32) -> Option<User> {
        self.users.iter().find(|u| u.id == uid).cloned()
    }

    fn uname2user(&self, uname: &str) -> Option<User> {
        self.users.iter().find(|u| u.name == uname).cloned()
    }

    fn gid2group(&self, gid: u32) -> Option<Group> {
        self.groups.iter().find(|g| g.id == gid).cloned()
    }

    fn gname2group(&self, gname: &str) -> Option<Group> {
        self.groups.iter().find(|g| g.name == gname).cloned()
    }
}

/// Authentication hook of the server engine
///
/// Auth fids are identified by their number. Without an `Auth` the server
/// answers `Tauth` with "no authentication required".
#[async_trait]
pub trait Auth: Send + Sync {
    /// Start an authentication conversation on `afid`, returning its qid
    async fn init(&self, afid: u32, user: &User, aname: &str) -> Result<QId>;

    /// The auth fid was clunked
    fn destroy(&self, afid: u32);

    /// Decide whether `user` may attach to `aname`; `afid` is `None` when the
    /// client did not authenticate
    async fn check(&self, afid: Option<u32>, user: &User, aname: &str) -> Result<()>;

    async fn read(&self, afid: u32, offset: u64, count: u32) -> Result<Vec<u8>>;

    async fn write(&self, afid: u32, offset: u64, data: &[u8]) -> Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_users_resolve_both_ways() {
        let users = StaticUsers::new()
            .group("sys", 100)
            .user("glenda", 1000, 100)
            .user("adm", 1001, 100);

        let glenda = users.uname2user("glenda").unwrap();
        assert_eq!(glenda.id, 1000);
        assert!(glenda.is_member(100));
        assert_eq!(users.uid2user(1001).unwrap().name, "adm");
        assert!(users.uname2user("nobody-here").is_none());
        assert_eq!(users.gname2group("sys").unwrap().id, 100);
        assert_eq!(
            users.gid2group(100).unwrap().members,
            vec!["glenda".to_owned(), "adm".to_owned()]
        );
    }

    #[test]
    fn os_users_know_root() {
        let users = OsUsers::new();
        let root = users.uid2user(0).unwrap();
        assert_eq!(root.name, "root");
        assert_eq!(users.uname2user("root").unwrap().id, 0);
    }
}
