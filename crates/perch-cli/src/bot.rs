//! Reference bot layer: a handful of commands exercising the engine.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use perch_commands::{
    CommandDefinition, CommandSet, OptionDefinition, OptionKind, command_callback,
};
use perch_gateway::client::{EventContext, EventLayer};
use perch_gateway::protocol::{EventCode, dispatch};
use perch_registry::{DEFAULT_PRIORITY, EventRegistry, LayerId, handler};
use perch_store::{GroupStore, ItemSpec, ItemValue};

const LAYER: LayerId = "perch::reference-bot";

/// Demo bot: liveness check, echo, and a per-guild motto backed by the
/// group store.
pub struct ReferenceBot {
    store_path: PathBuf,
    store: Arc<Mutex<Option<GroupStore>>>,
}

impl ReferenceBot {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            store_path,
            store: Arc::new(Mutex::new(None)),
        }
    }

    fn schema() -> Vec<ItemSpec> {
        vec![ItemSpec::one("motto")]
    }
}

/// Pull a named string option out of the raw options array.
fn string_option(options: &Value, name: &str) -> Option<String> {
    options.as_array()?.iter().find_map(|opt| {
        (opt["name"] == name).then(|| opt["value"].as_str().map(str::to_string))?
    })
}

impl EventLayer for ReferenceBot {
    fn id(&self) -> LayerId {
        LAYER
    }

    fn register(&self, registry: &mut EventRegistry<EventCode, EventContext>) {
        // The store is keyed by guild, so it can only be opened once the
        // session reports which guilds it belongs to.
        let store = Arc::clone(&self.store);
        let path = self.store_path.clone();
        registry.register_ordered(
            EventCode::dispatch(dispatch::READY),
            DEFAULT_PRIORITY,
            LAYER,
            handler(move |ctx: EventContext, _body: Value| {
                let store = Arc::clone(&store);
                let path = path.clone();
                async move {
                    let loaded = GroupStore::load(path, ReferenceBot::schema(), &ctx.guild_ids())
                        .context("failed to open the group store")?;
                    info!("group store ready at {}", loaded.path().display());
                    *store.lock().expect("store lock poisoned") = Some(loaded);
                    Ok(())
                }
            }),
        );
    }

    fn commands(&self, commands: &mut CommandSet<EventContext>) -> Result<()> {
        commands.insert(
            CommandDefinition::new("ping", "Check that the bot is alive"),
            command_callback(|_ctx: EventContext, rsp, _inv| async move {
                rsp.respond("pong", false, false).await?;
                Ok(())
            }),
        )?;

        commands.insert(
            CommandDefinition::new("echo", "Repeat a message back").option(
                OptionDefinition::new("text", "What to repeat", OptionKind::Text).required(),
            ),
            command_callback(|_ctx: EventContext, rsp, inv| async move {
                let text = string_option(&inv.options, "text").unwrap_or_default();
                rsp.respond(text, false, false).await?;
                Ok(())
            }),
        )?;

        let store = Arc::clone(&self.store);
        commands.insert(
            CommandDefinition::new("motto", "Show or set this guild's motto").option(
                OptionDefinition::new("set", "New motto to store", OptionKind::Text),
            ),
            command_callback(move |_ctx: EventContext, rsp, inv| {
                let store = Arc::clone(&store);
                async move {
                    let Some(guild_id) = inv.guild_id else {
                        rsp.respond("This command only works in a guild.", true, false)
                            .await?;
                        return Ok(());
                    };
                    let reply = {
                        let mut guard = store.lock().expect("store lock poisoned");
                        match guard.as_mut() {
                            None => "The store is still warming up.".to_string(),
                            Some(store) => match string_option(&inv.options, "set") {
                                Some(new_motto) => {
                                    store.set(&guild_id, "motto", new_motto.clone())?;
                                    store.save()?;
                                    format!("Motto set to: {new_motto}")
                                }
                                None => match store.get(&guild_id, "motto") {
                                    Some(ItemValue::One(motto)) => motto.clone(),
                                    _ => "No motto set yet.".to_string(),
                                },
                            },
                        }
                    };
                    rsp.respond(reply, false, false).await?;
                    Ok(())
                }
            }),
        )?;

        Ok(())
    }
}
