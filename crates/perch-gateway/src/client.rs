//! Client assembly: layers, context, and the run loop
//!
//! A bot is built from event layers stacked most-ancestral first. The core
//! layer at the bottom handles session readiness and interaction routing;
//! each layer above contributes handlers and command declarations. The
//! assembled client owns one gateway session and runs it to completion.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use perch_commands::{CommandSet, Invocation, reconcile};
use perch_directory::Directory;
use perch_interactions::InteractionResponder;
use perch_registry::{DEFAULT_PRIORITY, EventRegistry, LayerId, handler};

use crate::protocol::{EventCode, Interaction, Ready, dispatch};
use crate::session::{GatewayConfig, GatewaySession, SessionHandle};
use crate::transport::{Connector, WsConnector};

/// Default Discord gateway endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Layer id of the built-in bottom layer.
pub const LAYER_CORE: LayerId = "perch::core";

/// The context cloned into every handler invocation.
#[derive(Clone)]
pub struct EventContext {
    session: SessionHandle,
    directory: Arc<dyn Directory>,
    state: Arc<ContextState>,
}

struct ContextState {
    commands: CommandSet<EventContext>,
    guilds: RwLock<Vec<String>>,
    reconcile_on_ready: bool,
}

impl EventContext {
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn directory(&self) -> Arc<dyn Directory> {
        Arc::clone(&self.directory)
    }

    pub fn commands(&self) -> &CommandSet<EventContext> {
        &self.state.commands
    }

    /// Ids of the groups the session currently belongs to.
    pub fn guild_ids(&self) -> Vec<String> {
        self.state.guilds.read().expect("guild list lock poisoned").clone()
    }

    fn set_guild_ids(&self, ids: Vec<String>) {
        *self.state.guilds.write().expect("guild list lock poisoned") = ids;
    }
}

/// One stackable contributor of handlers and commands.
pub trait EventLayer: Send + Sync {
    /// Unique layer id; also names this layer in resolved chain order.
    fn id(&self) -> LayerId;

    /// Contribute event handlers.
    fn register(&self, registry: &mut EventRegistry<EventCode, EventContext>);

    /// Declare commands. The default declares none.
    fn commands(&self, commands: &mut CommandSet<EventContext>) -> Result<()> {
        let _ = commands;
        Ok(())
    }
}

// ── core layer ──────────────────────────────────────────────────

fn register_core(registry: &mut EventRegistry<EventCode, EventContext>) {
    registry.register_ordered(
        EventCode::dispatch(dispatch::READY),
        DEFAULT_PRIORITY,
        LAYER_CORE,
        handler(on_ready),
    );
    registry.register_ordered(
        EventCode::dispatch(dispatch::INTERACTION_CREATE),
        DEFAULT_PRIORITY,
        LAYER_CORE,
        handler(on_interaction),
    );
}

async fn on_ready(ctx: EventContext, body: Value) -> Result<()> {
    let ready: Ready = serde_json::from_value(body).context("malformed ready body")?;
    ctx.set_guild_ids(ready.guild_ids());
    info!("{} is ready ({} guilds)", ready.user.username, ready.guilds.len());

    if ctx.state.reconcile_on_ready {
        let report = reconcile(
            ctx.directory.as_ref(),
            ctx.state.commands.definitions(),
            &ctx.guild_ids(),
        )
        .await;
        info!("command reconciliation: {report}");
    }
    Ok(())
}

async fn on_interaction(ctx: EventContext, body: Value) -> Result<()> {
    let ixn: Interaction = serde_json::from_value(body).context("malformed interaction body")?;
    let Some(name) = ixn.data.as_ref().and_then(|d| d.name.clone()) else {
        debug!("interaction {} carries no command name", ixn.id);
        return Ok(());
    };
    let Some(entry) = ctx.state.commands.get(&name) else {
        debug!("no command named '{name}' is declared");
        return Ok(());
    };

    let responder = Arc::new(InteractionResponder::new(
        ixn.id.clone(),
        ixn.token.clone(),
        ctx.directory(),
    ));
    let invocation = Invocation {
        guild_id: ixn.guild_id.clone(),
        options: ixn.data.and_then(|d| d.options).unwrap_or(Value::Null),
    };
    let callback = Arc::clone(&entry.callback);
    callback(ctx.clone(), responder, invocation)
        .await
        .with_context(|| format!("command '{name}' failed"))
}

// ── builder ─────────────────────────────────────────────────────

/// Assembles a [`GatewayClient`] from layers and a directory client.
pub struct GatewayClientBuilder {
    endpoint: Url,
    layers: Vec<Box<dyn EventLayer>>,
    directory: Option<Arc<dyn Directory>>,
    handler_timeout: Option<Duration>,
    reconcile_on_ready: bool,
}

impl GatewayClientBuilder {
    pub fn new() -> Self {
        Self {
            // The constant is known-valid.
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid url"),
            layers: Vec::new(),
            directory: None,
            handler_timeout: None,
            reconcile_on_ready: true,
        }
    }

    pub fn endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Stack one layer on top of those added so far.
    pub fn layer(mut self, layer: impl EventLayer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Stack an already boxed layer.
    pub fn layer_boxed(mut self, layer: Box<dyn EventLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Bound each handler-chain invocation to the given duration.
    pub fn handler_timeout(mut self, limit: Duration) -> Self {
        self.handler_timeout = Some(limit);
        self
    }

    /// Leave the remote command set untouched on session readiness.
    pub fn skip_reconciliation(mut self) -> Self {
        self.reconcile_on_ready = false;
        self
    }

    pub fn build(self) -> Result<GatewayClient<WsConnector>> {
        self.build_with_connector(WsConnector)
    }

    pub fn build_with_connector<C: Connector>(self, connector: C) -> Result<GatewayClient<C>> {
        let directory = match self.directory {
            Some(directory) => directory,
            None => bail!("a directory client is required to build a gateway client"),
        };

        let mut registry = EventRegistry::new();
        register_core(&mut registry);
        let mut commands = CommandSet::new();
        let mut lineage = vec![LAYER_CORE];
        for layer in &self.layers {
            let id = layer.id();
            if lineage.contains(&id) {
                bail!("layer id '{id}' appears twice in the stack");
            }
            lineage.push(id);
            layer.register(&mut registry);
            // Each layer declares into its own set; a name redeclared by a
            // more derived layer then replaces the ancestor's command.
            let mut declared = CommandSet::new();
            layer
                .commands(&mut declared)
                .with_context(|| format!("layer '{id}' declared an invalid command set"))?;
            commands.absorb(declared);
        }

        Ok(GatewayClient {
            endpoint: self.endpoint,
            connector,
            registry: Arc::new(registry),
            lineage,
            directory,
            commands,
            handler_timeout: self.handler_timeout,
            reconcile_on_ready: self.reconcile_on_ready,
            cancel: CancellationToken::new(),
        })
    }
}

impl Default for GatewayClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An assembled bot: layered registry, command set, and one session.
pub struct GatewayClient<C: Connector> {
    endpoint: Url,
    connector: C,
    registry: Arc<EventRegistry<EventCode, EventContext>>,
    lineage: Vec<LayerId>,
    directory: Arc<dyn Directory>,
    commands: CommandSet<EventContext>,
    handler_timeout: Option<Duration>,
    reconcile_on_ready: bool,
    cancel: CancellationToken,
}

impl<C: Connector> std::fmt::Debug for GatewayClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("endpoint", &self.endpoint)
            .field("lineage", &self.lineage)
            .field("handler_timeout", &self.handler_timeout)
            .field("reconcile_on_ready", &self.reconcile_on_ready)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> GatewayClient<C> {
    /// Token that stops the session when cancelled. Clone it out before
    /// calling [`start`](Self::start).
    pub fn stopper(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Layer ids in lineage order, core first.
    pub fn lineage(&self) -> &[LayerId] {
        &self.lineage
    }

    /// Connect and run until stopped or torn down by an unrecoverable
    /// fault. Blocks the caller for the lifetime of the session.
    pub async fn start(self, token: &str, intents: u64) -> Result<()> {
        let config = GatewayConfig {
            endpoint: self.endpoint,
            token: token.to_string(),
            intents,
            handler_timeout: self.handler_timeout,
        };
        let session = GatewaySession::new(
            config,
            self.connector,
            Arc::clone(&self.registry),
            self.lineage.clone(),
            self.cancel.clone(),
        );
        let ctx = EventContext {
            session: session.handle(),
            directory: Arc::clone(&self.directory),
            state: Arc::new(ContextState {
                commands: self.commands,
                guilds: RwLock::new(Vec::new()),
                reconcile_on_ready: self.reconcile_on_ready,
            }),
        };
        session.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use perch_directory::{DirectoryError, MessageTarget};

    struct NullDirectory;

    #[async_trait]
    impl Directory for NullDirectory {
        async fn list_global_definitions(&self) -> Result<Vec<Value>, DirectoryError> {
            Ok(Vec::new())
        }
        async fn list_scoped_definitions(&self, _: &str) -> Result<Vec<Value>, DirectoryError> {
            Ok(Vec::new())
        }
        async fn create_definition(
            &self,
            _: Option<&str>,
            def: &Value,
        ) -> Result<Value, DirectoryError> {
            Ok(def.clone())
        }
        async fn patch_definition(
            &self,
            _: Option<&str>,
            _: &str,
            def: &Value,
        ) -> Result<Value, DirectoryError> {
            Ok(def.clone())
        }
        async fn delete_definition(&self, _: Option<&str>, _: &str) -> Result<(), DirectoryError> {
            Ok(())
        }
        async fn post_initial_response(
            &self,
            _: &str,
            _: &str,
            _: &Value,
        ) -> Result<(), DirectoryError> {
            Ok(())
        }
        async fn post_followup(&self, _: &str, _: &Value) -> Result<Option<Value>, DirectoryError> {
            Ok(None)
        }
        async fn patch_message(
            &self,
            _: &str,
            _: &MessageTarget,
            _: &Value,
        ) -> Result<(), DirectoryError> {
            Ok(())
        }
    }

    struct Plain(LayerId);

    impl EventLayer for Plain {
        fn id(&self) -> LayerId {
            self.0
        }
        fn register(&self, _: &mut EventRegistry<EventCode, EventContext>) {}
    }

    #[test]
    fn lineage_is_core_then_layers_in_stack_order() {
        let client = GatewayClientBuilder::new()
            .directory(Arc::new(NullDirectory))
            .layer(Plain("mid"))
            .layer(Plain("bot"))
            .build()
            .unwrap();
        assert_eq!(client.lineage(), &[LAYER_CORE, "mid", "bot"]);
    }

    #[test]
    fn duplicate_layer_ids_are_rejected() {
        let err = GatewayClientBuilder::new()
            .directory(Arc::new(NullDirectory))
            .layer(Plain("bot"))
            .layer(Plain("bot"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("appears twice"));
    }

    #[test]
    fn missing_directory_is_rejected() {
        let err = GatewayClientBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("directory client is required"));
    }
}
