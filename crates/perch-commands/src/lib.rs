//! Declarative commands and remote reconciliation
//!
//! Bots declare [`CommandDefinition`]s with callbacks at construction time;
//! the reconciler then makes the remotely registered set match the local
//! declarations with minimal create/patch/delete traffic.

pub mod definition;
pub mod reconciler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, bail};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use perch_interactions::InteractionResponder;

pub use definition::{
    Choice, CommandDefinition, CommandKind, OptionDefinition, OptionKind, RemoteCommandRecord,
    Scope,
};
pub use reconciler::{ReconcileReport, reconcile};

/// What a callback learns about the inbound interaction: where it came from
/// and the raw option values.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub guild_id: Option<String>,
    pub options: Value,
}

/// Callback invoked when an inbound interaction names this command. Receives
/// the consumer context, the responder for this interaction, and the
/// invocation details.
pub type CommandCallback<Ctx> = Arc<
    dyn Fn(Ctx, Arc<InteractionResponder>, Invocation) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Wrap a plain async fn/closure into a [`CommandCallback`].
pub fn command_callback<Ctx, F, Fut>(f: F) -> CommandCallback<Ctx>
where
    F: Fn(Ctx, Arc<InteractionResponder>, Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, rsp, invocation| Box::pin(f(ctx, rsp, invocation)))
}

/// One declared command with its callback.
pub struct CommandEntry<Ctx> {
    pub definition: CommandDefinition,
    pub callback: CommandCallback<Ctx>,
}

/// The set of commands a bot declares. Names are unique across the set;
/// declaring the same name twice is a construction error.
pub struct CommandSet<Ctx> {
    by_name: HashMap<String, CommandEntry<Ctx>>,
}

impl<Ctx> Default for CommandSet<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> CommandSet<Ctx> {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        definition: CommandDefinition,
        callback: CommandCallback<Ctx>,
    ) -> Result<()> {
        if self.by_name.contains_key(&definition.name) {
            bail!("command '{}' has been declared twice", definition.name);
        }
        self.by_name.insert(
            definition.name.clone(),
            CommandEntry {
                definition,
                callback,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CommandEntry<Ctx>> {
        self.by_name.get(name)
    }

    /// Merge another set into this one. Names already present are replaced:
    /// the absorbed (more derived) declaration wins outright.
    pub fn absorb(&mut self, other: CommandSet<Ctx>) {
        for (name, entry) in other.by_name {
            if self.by_name.insert(name.clone(), entry).is_some() {
                debug!("command '{name}' overridden by a more derived declaration");
            }
        }
    }

    /// Snapshot of the declared definitions, for the reconciler.
    pub fn definitions(&self) -> Vec<CommandDefinition> {
        self.by_name.values().map(|e| e.definition.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop<Ctx: Send + 'static>() -> CommandCallback<Ctx> {
        command_callback(|_ctx: Ctx, _rsp, _options| async { Ok(()) })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut set: CommandSet<()> = CommandSet::new();
        set.insert(CommandDefinition::new("ping", "Check liveness"), noop())
            .unwrap();
        let err = set
            .insert(CommandDefinition::new("ping", "Again"), noop())
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn absorb_replaces_redeclared_names() {
        let mut base: CommandSet<()> = CommandSet::new();
        base.insert(CommandDefinition::new("ping", "Base ping"), noop())
            .unwrap();
        base.insert(CommandDefinition::new("only_base", "Stays"), noop())
            .unwrap();

        let mut derived: CommandSet<()> = CommandSet::new();
        derived
            .insert(CommandDefinition::new("ping", "Derived ping"), noop())
            .unwrap();

        base.absorb(derived);
        assert_eq!(base.len(), 2);
        assert_eq!(base.get("ping").unwrap().definition.description, "Derived ping");
        assert!(base.get("only_base").is_some());
    }

    #[test]
    fn definitions_snapshot() {
        let mut set: CommandSet<()> = CommandSet::new();
        set.insert(CommandDefinition::new("ping", "Check liveness"), noop())
            .unwrap();
        set.insert(
            CommandDefinition::new("echo", "Repeat input").for_group("g1"),
            noop(),
        )
        .unwrap();

        let mut names: Vec<_> = set.definitions().into_iter().map(|d| d.name).collect();
        names.sort();
        assert_eq!(names, vec!["echo", "ping"]);
    }
}
