//! Remote-definition reconciler
//!
//! Runs once per completed handshake. Takes two snapshots of the remote
//! state (global and per active group scope), then walks the local
//! declarations: absent definitions are created, present ones are patched
//! unconditionally (idempotent overwrite beats diffing) and claimed, and
//! whatever remains unclaimed afterwards is deleted. Scopes reconcile
//! concurrently; operations within one scope stay serialized because the
//! remote side does not make concurrent same-scope writes idempotent.

use std::collections::HashMap;

use futures_util::future::join_all;
use tracing::{info, warn};

use perch_directory::{Directory, DirectoryError};

use crate::definition::{CommandDefinition, RemoteCommandRecord, Scope};

/// Outcome counts of one reconciliation pass. Failures are counted, never
/// fatal: the sync is best effort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub patched: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.created += other.created;
        self.patched += other.patched;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} patched, {} deleted, {} failed",
            self.created, self.patched, self.deleted, self.failed
        )
    }
}

/// Make the remote definitions match `local`, for the global scope and every
/// scope in `active_scopes`. Definitions declared for a scope outside the
/// active set are still created; without a snapshot nothing can be patched
/// or pruned there.
pub async fn reconcile(
    directory: &dyn Directory,
    local: Vec<CommandDefinition>,
    active_scopes: &[String],
) -> ReconcileReport {
    let mut by_scope: HashMap<Scope, Vec<CommandDefinition>> = HashMap::new();
    for def in local {
        by_scope.entry(def.scope.clone()).or_default().push(def);
    }
    // Active scopes with no local declarations still need their snapshot
    // walked so stale remote definitions get pruned.
    by_scope.entry(Scope::Global).or_default();
    for scope_id in active_scopes {
        by_scope.entry(Scope::Group(scope_id.clone())).or_default();
    }

    let active: Vec<&str> = active_scopes.iter().map(String::as_str).collect();
    let tasks = by_scope.into_iter().map(|(scope, defs)| {
        let snapshot_available =
            matches!(&scope, Scope::Global) || scope.id().is_some_and(|id| active.contains(&id));
        reconcile_scope(directory, scope, defs, snapshot_available)
    });

    let mut report = ReconcileReport::default();
    for partial in join_all(tasks).await {
        report.merge(partial);
    }
    info!("command reconciliation finished: {report}");
    report
}

async fn reconcile_scope(
    directory: &dyn Directory,
    scope: Scope,
    defs: Vec<CommandDefinition>,
    snapshot_available: bool,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let mut snapshot: HashMap<String, RemoteCommandRecord> = HashMap::new();
    if snapshot_available {
        match fetch_snapshot(directory, &scope).await {
            Ok(records) => snapshot = records,
            Err(err) => {
                warn!("failed to list remote definitions for {scope}: {err}");
                report.failed += 1;
                // Without a snapshot everything would look absent; creating
                // duplicates and deleting nothing is the safe degradation,
                // but pruning must be skipped below.
            }
        }
    }

    for def in &defs {
        match snapshot.remove(&def.name) {
            Some(remote) => {
                match directory
                    .patch_definition(scope.id(), &remote.id, &def.to_wire())
                    .await
                {
                    Ok(_) => {
                        info!("patched '{}' in {scope}", def.name);
                        report.patched += 1;
                    }
                    Err(err) => {
                        warn!("failed to patch '{}' in {scope}: {err}", def.name);
                        report.failed += 1;
                    }
                }
            }
            None => match directory.create_definition(scope.id(), &def.to_wire()).await {
                Ok(_) => {
                    info!("created '{}' in {scope}", def.name);
                    report.created += 1;
                }
                Err(err) => {
                    warn!("failed to create '{}' in {scope}: {err}", def.name);
                    report.failed += 1;
                }
            },
        }
    }

    // Everything still in the snapshot exists remotely but is no longer
    // declared locally.
    for (name, remote) in snapshot {
        match directory.delete_definition(scope.id(), &remote.id).await {
            Ok(()) => {
                info!("deleted '{name}' from {scope}");
                report.deleted += 1;
            }
            Err(err) => {
                warn!("failed to delete '{name}' from {scope}: {err}");
                report.failed += 1;
            }
        }
    }

    report
}

async fn fetch_snapshot(
    directory: &dyn Directory,
    scope: &Scope,
) -> Result<HashMap<String, RemoteCommandRecord>, DirectoryError> {
    let raw = match scope.id() {
        None => directory.list_global_definitions().await?,
        Some(scope_id) => directory.list_scoped_definitions(scope_id).await?,
    };
    let mut records = HashMap::new();
    for value in &raw {
        match RemoteCommandRecord::from_wire(value) {
            Some(record) => {
                records.insert(record.name.clone(), record);
            }
            None => warn!("dropping malformed remote definition record: {value}"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use perch_directory::MessageTarget;

    /// In-memory directory that mutates its remote state like the real one,
    /// so back-to-back reconciliations observe each other's writes.
    #[derive(Default)]
    struct FakeDirectory {
        // scope id (None = global) -> name -> (remote id, body)
        remote: Mutex<HashMap<Option<String>, HashMap<String, (String, Value)>>>,
        next_id: AtomicU64,
        fail_create_named: Option<String>,
    }

    impl FakeDirectory {
        fn seeded(scope: Option<&str>, names: &[&str]) -> Self {
            let dir = Self::default();
            dir.seed(scope, names);
            dir
        }

        fn seed(&self, scope: Option<&str>, names: &[&str]) {
            let mut remote = self.remote.lock().unwrap();
            let entry = remote.entry(scope.map(String::from)).or_default();
            for name in names {
                let id = format!("seed-{name}");
                entry.insert(name.to_string(), (id, json!({ "name": name })));
            }
        }

        fn names(&self, scope: Option<&str>) -> Vec<String> {
            let remote = self.remote.lock().unwrap();
            let mut names: Vec<String> = remote
                .get(&scope.map(String::from))
                .map(|defs| defs.keys().cloned().collect())
                .unwrap_or_default();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn list_global_definitions(&self) -> Result<Vec<Value>, DirectoryError> {
            self.list_scoped(None).await
        }

        async fn list_scoped_definitions(
            &self,
            scope_id: &str,
        ) -> Result<Vec<Value>, DirectoryError> {
            self.list_scoped(Some(scope_id)).await
        }

        async fn create_definition(
            &self,
            scope: Option<&str>,
            def: &Value,
        ) -> Result<Value, DirectoryError> {
            let name = def["name"].as_str().unwrap_or_default().to_string();
            if self.fail_create_named.as_deref() == Some(name.as_str()) {
                return Err(DirectoryError::Status {
                    code: 500,
                    body: "simulated".into(),
                });
            }
            let id = format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.remote
                .lock()
                .unwrap()
                .entry(scope.map(String::from))
                .or_default()
                .insert(name, (id.clone(), def.clone()));
            Ok(json!({ "id": id }))
        }

        async fn patch_definition(
            &self,
            scope: Option<&str>,
            id: &str,
            def: &Value,
        ) -> Result<Value, DirectoryError> {
            let name = def["name"].as_str().unwrap_or_default().to_string();
            self.remote
                .lock()
                .unwrap()
                .entry(scope.map(String::from))
                .or_default()
                .insert(name, (id.to_string(), def.clone()));
            Ok(json!({ "id": id }))
        }

        async fn delete_definition(
            &self,
            scope: Option<&str>,
            id: &str,
        ) -> Result<(), DirectoryError> {
            let mut remote = self.remote.lock().unwrap();
            if let Some(defs) = remote.get_mut(&scope.map(String::from)) {
                defs.retain(|_, (existing, _)| existing != id);
            }
            Ok(())
        }

        async fn post_initial_response(
            &self,
            _: &str,
            _: &str,
            _: &Value,
        ) -> Result<(), DirectoryError> {
            unreachable!("reconciler never posts responses")
        }

        async fn post_followup(&self, _: &str, _: &Value) -> Result<Option<Value>, DirectoryError> {
            unreachable!("reconciler never posts followups")
        }

        async fn patch_message(
            &self,
            _: &str,
            _: &MessageTarget,
            _: &Value,
        ) -> Result<(), DirectoryError> {
            unreachable!("reconciler never edits messages")
        }
    }

    impl FakeDirectory {
        async fn list_scoped(&self, scope: Option<&str>) -> Result<Vec<Value>, DirectoryError> {
            let remote = self.remote.lock().unwrap();
            Ok(remote
                .get(&scope.map(String::from))
                .map(|defs| {
                    defs.iter()
                        .map(|(name, (id, _))| json!({ "id": id, "name": name }))
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn def(name: &str) -> CommandDefinition {
        CommandDefinition::new(name, format!("The {name} command"))
    }

    #[tokio::test]
    async fn converges_on_local_declarations() {
        let dir = FakeDirectory::seeded(None, &["a", "b", "c"]);
        let report = reconcile(&dir, vec![def("a"), def("d")], &[]).await;

        assert_eq!(
            report,
            ReconcileReport {
                created: 1,
                patched: 1,
                deleted: 2,
                failed: 0
            }
        );
        assert_eq!(dir.names(None), vec!["a", "d"]);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let dir = FakeDirectory::seeded(None, &["a", "b", "c"]);
        let local = vec![def("a"), def("d")];

        let first = reconcile(&dir, local.clone(), &[]).await;
        let second = reconcile(&dir, local, &[]).await;

        assert_eq!(first.created + first.patched, 2);
        assert_eq!(second.deleted, 0);
        assert_eq!(second.created, 0);
        assert_eq!(second.patched, 2);
        assert_eq!(dir.names(None), vec!["a", "d"]);
    }

    #[tokio::test]
    async fn scoped_and_global_snapshots_are_independent() {
        let dir = FakeDirectory::seeded(None, &["global_old"]);
        dir.seed(Some("g1"), &["scoped_old", "keep"]);

        let local = vec![def("fresh"), def("keep").for_group("g1")];
        let report = reconcile(&dir, local, &["g1".to_string()]).await;

        assert_eq!(report.created, 1); // fresh, globally
        assert_eq!(report.patched, 1); // keep, in g1
        assert_eq!(report.deleted, 2); // global_old and scoped_old
        assert_eq!(dir.names(None), vec!["fresh"]);
        assert_eq!(dir.names(Some("g1")), vec!["keep"]);
    }

    #[tokio::test]
    async fn inactive_scope_declarations_are_created_blindly() {
        let dir = FakeDirectory::default();
        let local = vec![def("orphan").for_group("g9")];

        // g9 is not in the active set: no snapshot, no pruning, create only.
        let report = reconcile(&dir, local, &[]).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(dir.names(Some("g9")), vec!["orphan"]);
    }

    #[tokio::test]
    async fn single_failure_does_not_abort_the_rest() {
        let dir = FakeDirectory {
            fail_create_named: Some("bad".to_string()),
            ..FakeDirectory::seeded(None, &["stale"])
        };

        let report = reconcile(&dir, vec![def("bad"), def("good")], &[]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(dir.names(None), vec!["good"]);
    }

    #[tokio::test]
    async fn active_scope_with_no_declarations_is_pruned() {
        let dir = FakeDirectory::seeded(Some("g1"), &["leftover"]);
        let report = reconcile(&dir, Vec::new(), &["g1".to_string()]).await;
        assert_eq!(report.deleted, 1);
        assert!(dir.names(Some("g1")).is_empty());
    }
}
