//! Virtual systems, their filesystems, and per-context login stacks.
//!
//! Everything here is tick-thread state: it is only touched from dispatch,
//! task steps and completion callbacks, so nothing is locked.

use crate::error::{DispatchError, FsError};

use hacknet_env::{ContextId, Pid, SystemId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// An entry in a virtual filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Directory,
    File { contents: String },
}

/// Flat in-memory directory tree keyed by normalized absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    nodes: BTreeMap<String, Node>,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem {
    /// Creates a filesystem holding only `/`.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Directory);
        Self { nodes }
    }

    /// Normalizes `path` against `cwd`, resolving `.` and `..`.
    pub fn resolve(cwd: &str, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", cwd, path)
        };

        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        format!("/{}", parts.join("/"))
    }

    fn parent(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Directory))
    }

    /// Creates `path` and every missing ancestor.
    pub fn mkdir_p(&mut self, path: &str) -> Result<(), FsError> {
        let path = Self::resolve("/", path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.nodes.get(&current) {
                Some(Node::Directory) => {}
                Some(Node::File { .. }) => return Err(FsError::NotADirectory(current)),
                None => {
                    self.nodes.insert(current.clone(), Node::Directory);
                }
            }
        }
        Ok(())
    }

    /// Creates or replaces a file. The parent directory must exist.
    pub fn write(&mut self, path: &str, contents: impl Into<String>) -> Result<(), FsError> {
        let path = Self::resolve("/", path);
        if self.is_dir(&path) {
            return Err(FsError::IsADirectory(path));
        }
        let parent = Self::parent(&path);
        match self.nodes.get(parent) {
            Some(Node::Directory) => {}
            Some(Node::File { .. }) => return Err(FsError::NotADirectory(parent.to_string())),
            None => return Err(FsError::NotFound(parent.to_string())),
        }
        self.nodes.insert(path, Node::File { contents: contents.into() });
        Ok(())
    }

    pub fn read(&self, path: &str) -> Result<&str, FsError> {
        match self.nodes.get(path) {
            Some(Node::File { contents }) => Ok(contents),
            Some(Node::Directory) => Err(FsError::IsADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Removes a file. Directories are left alone.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        match self.nodes.get(path) {
            Some(Node::File { .. }) => {
                self.nodes.remove(path);
                Ok(())
            }
            Some(Node::Directory) => Err(FsError::IsADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Names of the direct children of a directory, sorted.
    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        match self.nodes.get(path) {
            Some(Node::Directory) => {}
            Some(Node::File { .. }) => return Err(FsError::NotADirectory(path.to_string())),
            None => return Err(FsError::NotFound(path.to_string())),
        }

        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let names = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(names)
    }
}

/// A user account on a virtual system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user: String,
    pub admin: bool,
    pub home: String,
}

/// One simulated machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualSystem {
    pub id: SystemId,
    pub hostname: String,
    pub fs: Filesystem,
    accounts: BTreeMap<String, Account>,

    /// Installed programs; `None` means every registered program
    programs: Option<BTreeSet<String>>,

    /// Last pid handed out. Live processes are not persisted, so a restored
    /// system starts counting again from 1.
    #[serde(skip)]
    next_pid: Pid,
}

impl VirtualSystem {
    /// Creates a system with an admin `root` account.
    pub fn new(id: SystemId, hostname: impl Into<String>) -> Self {
        let mut system = Self {
            id,
            hostname: hostname.into(),
            fs: Filesystem::new(),
            accounts: BTreeMap::new(),
            programs: None,
            next_pid: 0,
        };
        system.add_account("root", true);
        system
    }

    pub fn with_account(mut self, user: &str, admin: bool) -> Self {
        self.add_account(user, admin);
        self
    }

    /// Adds (or replaces) an account and creates its home directory.
    pub fn add_account(&mut self, user: &str, admin: bool) {
        let home = if user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", user)
        };
        if let Err(e) = self.fs.mkdir_p(&home) {
            warn!(system = %self.id, user, "cannot create home directory: {}", e);
        }
        self.accounts.insert(
            user.to_string(),
            Account {
                user: user.to_string(),
                admin,
                home,
            },
        );
    }

    pub fn account(&self, user: &str) -> Option<&Account> {
        self.accounts.get(user)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Whether `name` is installed on this system.
    pub fn has_program(&self, name: &str) -> bool {
        self.programs.as_ref().map_or(true, |programs| programs.contains(name))
    }

    /// Limits the installed programs to `names`.
    pub fn restrict_programs<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.programs = Some(names.into_iter().map(Into::into).collect());
    }

    /// Hands out the next pid. Pid 0 is never returned.
    pub fn allocate_pid(&mut self) -> Pid {
        self.next_pid = self.next_pid.checked_add(1).unwrap_or(1);
        self.next_pid
    }
}

/// An active login of a context on a system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub system: SystemId,
    pub user: String,

    /// Working directory
    pub cwd: String,

    /// Shell process owning this login, once started
    pub shell: Option<Pid>,

    pub admin: bool,
}

/// All systems of a World plus every context's login stack.
#[derive(Debug, Default)]
pub struct SystemDirectory {
    systems: BTreeMap<SystemId, VirtualSystem>,
    logins: HashMap<ContextId, Vec<Login>>,
}

impl SystemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from persisted systems, with nobody logged in.
    pub fn from_systems(systems: impl IntoIterator<Item = VirtualSystem>) -> Self {
        Self {
            systems: systems.into_iter().map(|s| (s.id, s)).collect(),
            logins: HashMap::new(),
        }
    }

    /// Adds a system, returning the one it replaced.
    pub fn insert(&mut self, system: VirtualSystem) -> Option<VirtualSystem> {
        self.systems.insert(system.id, system)
    }

    pub fn system(&self, id: SystemId) -> Option<&VirtualSystem> {
        self.systems.get(&id)
    }

    pub fn system_mut(&mut self, id: SystemId) -> Option<&mut VirtualSystem> {
        self.systems.get_mut(&id)
    }

    pub fn systems(&self) -> impl Iterator<Item = &VirtualSystem> {
        self.systems.values()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn find_by_hostname(&self, hostname: &str) -> Option<&VirtualSystem> {
        self.systems.values().find(|s| s.hostname == hostname)
    }

    /// Checks `user` against `hostname` and builds the login it would get.
    pub fn authenticate(&self, hostname: &str, user: &str) -> Result<Login, DispatchError> {
        let system = self
            .find_by_hostname(hostname)
            .ok_or_else(|| DispatchError::UnknownSystem(hostname.to_string()))?;
        let account = system.account(user).ok_or_else(|| DispatchError::LoginFailed {
            user: user.to_string(),
            hostname: hostname.to_string(),
        })?;
        Ok(Login {
            system: system.id,
            user: account.user.clone(),
            cwd: account.home.clone(),
            shell: None,
            admin: account.admin,
        })
    }

    /// Pushes a login on top of the context's stack.
    pub fn bind_login(&mut self, context: ContextId, login: Login) {
        self.logins.entry(context).or_default().push(login);
    }

    /// Removes the login owned by `shell` on `system`.
    pub fn unbind_login(&mut self, context: ContextId, system: SystemId, shell: Pid) -> Option<Login> {
        let stack = self.logins.get_mut(&context)?;
        let idx = stack
            .iter()
            .rposition(|login| login.system == system && login.shell == Some(shell))?;
        let login = stack.remove(idx);
        if stack.is_empty() {
            self.logins.remove(&context);
        }
        Some(login)
    }

    /// Drops every login of `context`.
    pub fn clear_logins(&mut self, context: ContextId) -> Vec<Login> {
        self.logins.remove(&context).unwrap_or_default()
    }

    /// The context's login stack, bottom first.
    pub fn logins(&self, context: ContextId) -> &[Login] {
        self.logins.get(&context).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn current_login(&self, context: ContextId) -> Option<&Login> {
        self.logins.get(&context).and_then(|stack| stack.last())
    }

    pub fn current_login_mut(&mut self, context: ContextId) -> Option<&mut Login> {
        self.logins.get_mut(&context).and_then(|stack| stack.last_mut())
    }

    /// The topmost login of `context` on `system`.
    pub fn login_for(&self, context: ContextId, system: SystemId) -> Option<&Login> {
        self.logins
            .get(&context)
            .and_then(|stack| stack.iter().rev().find(|login| login.system == system))
    }

    pub fn login_for_mut(&mut self, context: ContextId, system: SystemId) -> Option<&mut Login> {
        self.logins
            .get_mut(&context)
            .and_then(|stack| stack.iter_mut().rev().find(|login| login.system == system))
    }

    /// Resolves the system and login a command from `context` runs under.
    pub fn current_system_and_login(&self, context: ContextId) -> Result<(&VirtualSystem, &Login), DispatchError> {
        let login = self.current_login(context).ok_or(DispatchError::NotLoggedIn)?;
        let system = self
            .system(login.system)
            .ok_or_else(|| DispatchError::UnknownSystem(login.system.to_string()))?;
        Ok((system, login))
    }

    /// Clones every system for persistence.
    pub fn snapshot(&self) -> Vec<VirtualSystem> {
        self.systems.values().cloned().collect()
    }
}
