//! `RemoteRegistry` (spec.md §4.4/§3 "RemoteMap"): owns every [`WaveshellProc`] in the
//! process, keyed by `remote_id`, and resolves user-facing queries (id, alias, canonical
//! name, or an abbreviated id prefix) to one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use waveshell_pty::SecretCache;
use waveshell_updates::UserInputBus;

use crate::error::ProcError;
use crate::proc::{LaunchOpts, WaveshellProc};
use crate::remote::{ConnectMode, Remote};

/// The shortest unambiguous prefix the UI may use to refer to a remote by id.
const PARTIAL_ID_LEN: usize = 8;

pub struct RemoteRegistry {
    procs: StdMutex<HashMap<String, Arc<WaveshellProc>>>,
    secret_cache: Arc<SecretCache>,
    user_input: Arc<UserInputBus>,
}

impl RemoteRegistry {
    pub fn new(secret_cache: Arc<SecretCache>, user_input: Arc<UserInputBus>) -> Self {
        RemoteRegistry {
            procs: StdMutex::new(HashMap::new()),
            secret_cache,
            user_input,
        }
    }

    /// Add a new remote, refusing a duplicate `canonical_name` unless the existing entry is
    /// archived, and refusing a second local remote of the same sudo-ness regardless of name
    /// (spec.md §3/§4.4: at most one local non-sudo and one local sudo remote may exist).
    pub fn add_remote(&self, remote: Remote) -> Result<Arc<WaveshellProc>, ProcError> {
        let mut procs = self.procs.lock().unwrap();
        let duplicate_name = procs
            .values()
            .any(|p| p.remote.canonical_name == remote.canonical_name && !p.remote.archived);
        let duplicate_local = remote.is_local()
            && procs
                .values()
                .any(|p| !p.remote.archived && p.remote.is_local() && p.remote.is_local_sudo() == remote.is_local_sudo());
        if duplicate_name || duplicate_local {
            return Err(ProcError::DuplicateLocalRemote { sudo: remote.is_local_sudo() });
        }
        let proc = WaveshellProc::new(remote.clone(), self.secret_cache.clone(), self.user_input.clone());
        procs.insert(remote.remote_id.clone(), proc.clone());
        Ok(proc)
    }

    pub fn get_by_id(&self, remote_id: &str) -> Option<Arc<WaveshellProc>> {
        self.procs.lock().unwrap().get(remote_id).cloned()
    }

    pub fn get_by_canonical_name(&self, name: &str) -> Option<Arc<WaveshellProc>> {
        self.procs
            .lock()
            .unwrap()
            .values()
            .find(|p| p.remote.canonical_name == name)
            .cloned()
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<Arc<WaveshellProc>> {
        self.procs
            .lock()
            .unwrap()
            .values()
            .find(|p| p.remote.alias.as_deref() == Some(alias))
            .cloned()
    }

    /// Resolve a user-typed query: full id, alias, canonical name, or an unambiguous
    /// lowercase-hex id prefix of exactly [`PARTIAL_ID_LEN`] characters.
    pub fn resolve(&self, query: &str) -> Option<Arc<WaveshellProc>> {
        if let Some(p) = self.get_by_id(query) {
            return Some(p);
        }
        if let Some(p) = self.get_by_alias(query) {
            return Some(p);
        }
        if let Some(p) = self.get_by_canonical_name(query) {
            return Some(p);
        }
        if query.len() == PARTIAL_ID_LEN
            && query.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            let procs = self.procs.lock().unwrap();
            let mut matches = procs.values().filter(|p| p.remote_id().starts_with(query));
            let first = matches.next()?.clone();
            if matches.next().is_none() {
                return Some(first);
            }
        }
        None
    }

    /// Archive a remote: refused while connected, and for the local remote (spec.md §4.4;
    /// the local remote always exists and is never archivable).
    pub fn archive_remote(&self, remote_id: &str) -> Result<(), ProcError> {
        let proc = self.get_by_id(remote_id).ok_or(ProcError::NotConnected)?;
        if proc.remote.is_local() {
            return Err(ProcError::Archived);
        }
        if proc.status() == crate::status::Status::Connected {
            return Err(ProcError::DisconnectRefused {
                running: proc.running_cmd_count(),
            });
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<Arc<WaveshellProc>> {
        self.procs.lock().unwrap().values().cloned().collect()
    }

    /// Launch every non-archived remote whose `connect_mode` is `Startup`, in parallel.
    pub async fn launch_startup_remotes(&self, opts: LaunchOpts) {
        let startup: Vec<_> = self
            .all()
            .into_iter()
            .filter(|p| !p.remote.archived && p.remote.connect_mode == ConnectMode::Startup)
            .collect();
        let mut handles = Vec::with_capacity(startup.len());
        for proc in startup {
            let opts = opts.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = proc.launch(opts).await {
                    tracing::warn!(target: "waveshell_proc", "startup launch failed for {}: {e}", proc.remote_id());
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ShellPref, TransportConfig};
    use waveshell_pty::DEFAULT_SECRET_TIMEOUT;

    fn registry() -> RemoteRegistry {
        RemoteRegistry::new(
            Arc::new(SecretCache::new(Some(DEFAULT_SECRET_TIMEOUT))),
            Arc::new(UserInputBus::new()),
        )
    }

    fn local_remote(id: &str, name: &str, sudo: bool) -> Remote {
        Remote {
            remote_id: id.to_string(),
            canonical_name: name.to_string(),
            alias: None,
            transport: TransportConfig::Local { shell_path: "/bin/bash".to_string(), sudo },
            connect_mode: ConnectMode::Manual,
            auto_install: false,
            archived: false,
            preferred_shell: ShellPref::Detect,
        }
    }

    #[test]
    fn rejects_a_second_local_remote_of_the_same_sudo_ness_even_with_a_different_name() {
        let reg = registry();
        reg.add_remote(local_remote("r1", "local", false)).unwrap();
        let err = reg.add_remote(local_remote("r2", "local-two", false)).unwrap_err();
        assert!(matches!(err, ProcError::DuplicateLocalRemote { sudo: false }));
    }

    #[test]
    fn allows_one_local_sudo_and_one_local_non_sudo_remote_together() {
        let reg = registry();
        reg.add_remote(local_remote("r1", "local", false)).unwrap();
        reg.add_remote(local_remote("r2", "local-sudo", true)).unwrap();
        assert_eq!(reg.all().len(), 2);
    }

    #[test]
    fn rejects_a_duplicate_canonical_name_across_distinct_transports() {
        let reg = registry();
        reg.add_remote(local_remote("r1", "dev-box", false)).unwrap();
        let err = reg.add_remote(local_remote("r2", "dev-box", true)).unwrap_err();
        assert!(matches!(err, ProcError::DuplicateLocalRemote { .. }));
    }

    #[test]
    fn resolves_by_id_alias_canonical_name_and_unambiguous_prefix() {
        let reg = registry();
        let mut remote = local_remote("abcdef1234", "boxen", false);
        remote.alias = Some("dev".to_string());
        reg.add_remote(remote).unwrap();

        assert!(reg.resolve("abcdef1234").is_some());
        assert!(reg.resolve("dev").is_some());
        assert!(reg.resolve("boxen").is_some());
        assert!(reg.resolve("abcdef12").is_some());
        assert!(reg.resolve("nope").is_none());
    }

    #[test]
    fn archive_refuses_the_local_remote() {
        let reg = registry();
        reg.add_remote(local_remote("r1", "local", false)).unwrap();
        assert!(matches!(reg.archive_remote("r1"), Err(ProcError::Archived)));
    }
}
