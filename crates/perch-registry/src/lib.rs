//! Layered event handler registry
//!
//! One event code, many contributors, one deterministic call chain. Handler
//! layers form a lineage (most-ancestral first); each layer contributes
//! ordered handlers, and a concrete consumer resolves the merged chain for
//! its full lineage. Chains are built lazily on first resolve and cached,
//! so sibling lineages sharing an ancestor never observe each other's
//! contributions.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

/// Identifies one handler-bearing layer. The last layer of a lineage names
/// the concrete consumer and must be unique across lineages.
pub type LayerId = &'static str;

/// Priority assigned when a contributor does not ask for one. Lower runs
/// earlier; equal priorities preserve ancestor-before-descendant order.
pub const DEFAULT_PRIORITY: i32 = 0;

/// An async callback invoked with the consumer context and the event body.
pub type Handler<Ctx> =
    Arc<dyn Fn(Ctx, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap a plain async fn/closure into a [`Handler`].
pub fn handler<Ctx, F, Fut>(f: F) -> Handler<Ctx>
where
    F: Fn(Ctx, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, body| Box::pin(f(ctx, body)))
}

/// One node of a resolved chain.
pub struct ChainEntry<Ctx> {
    pub priority: i32,
    pub layer: LayerId,
    handler: Handler<Ctx>,
}

impl<Ctx> Clone for ChainEntry<Ctx> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            layer: self.layer,
            handler: Arc::clone(&self.handler),
        }
    }
}

/// The merged, ordered chain of handlers visible to one concrete lineage.
/// Immutable once built.
pub struct HandlerChain<Ctx> {
    entries: Vec<ChainEntry<Ctx>>,
}

impl<Ctx: Clone> HandlerChain<Ctx> {
    /// Call every node in chain order, awaiting each before the next. Later
    /// handlers may depend on side effects of earlier ones, so invocation is
    /// sequential. The first error aborts the remainder of the chain and
    /// propagates to the caller.
    pub async fn invoke(&self, ctx: Ctx, body: Value) -> anyhow::Result<()> {
        for entry in &self.entries {
            (entry.handler)(ctx.clone(), body.clone()).await?;
        }
        Ok(())
    }
}

impl<Ctx> HandlerChain<Ctx> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (priority, layer) pairs in call order.
    pub fn order(&self) -> Vec<(i32, LayerId)> {
        self.entries.iter().map(|e| (e.priority, e.layer)).collect()
    }
}

/// Registry of handler contributions, addressed by event code.
///
/// Two registration modes exist. Ordered contributions merge across the
/// whole lineage into one chain. Overrides are single-slot per name: the
/// most-derived layer that registered a name wins outright.
pub struct EventRegistry<K, Ctx> {
    ordered: HashMap<(K, LayerId), Vec<ChainEntry<Ctx>>>,
    overrides: HashMap<(K, LayerId), Handler<Ctx>>,
    cache: Mutex<HashMap<(K, LayerId), Arc<HandlerChain<Ctx>>>>,
}

impl<K, Ctx> Default for EventRegistry<K, Ctx>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, Ctx> EventRegistry<K, Ctx>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            ordered: HashMap::new(),
            overrides: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Record one ordered contributor for `code` under `layer`. Contributors
    /// registered by the same layer keep their declaration order.
    pub fn register_ordered(
        &mut self,
        code: K,
        priority: i32,
        layer: LayerId,
        handler: Handler<Ctx>,
    ) {
        self.ordered.entry((code, layer)).or_default().push(ChainEntry {
            priority,
            layer,
            handler,
        });
    }

    /// Record an override for `name` under `layer`. Re-registering the same
    /// (name, layer) replaces the previous handler.
    pub fn register_override(&mut self, name: K, layer: LayerId, handler: Handler<Ctx>) {
        self.overrides.insert((name, layer), handler);
    }

    /// Resolve the merged chain for `code` as seen by a consumer with the
    /// given lineage (most-ancestral layer first). Built lazily on first
    /// call and cached for the process lifetime; repeat calls return the
    /// same chain. Returns `None` when no layer contributed.
    pub fn resolve(&self, code: &K, lineage: &[LayerId]) -> Option<Arc<HandlerChain<Ctx>>> {
        let concrete = *lineage.last()?;
        if let Some(chain) = self
            .cache
            .lock()
            .expect("registry cache poisoned")
            .get(&(code.clone(), concrete))
        {
            return Some(Arc::clone(chain));
        }

        // Start from the nearest ancestral layer that already has a built
        // chain for this code. The copy keeps ancestor chains immutable:
        // additions for this lineage never leak into siblings.
        let mut entries: Vec<ChainEntry<Ctx>> = Vec::new();
        let mut from = 0;
        {
            let cache = self.cache.lock().expect("registry cache poisoned");
            for idx in (0..lineage.len().saturating_sub(1)).rev() {
                if let Some(chain) = cache.get(&(code.clone(), lineage[idx])) {
                    entries = chain.entries.clone();
                    from = idx + 1;
                    break;
                }
            }
        }

        for layer in &lineage[from..] {
            let Some(contributed) = self.ordered.get(&(code.clone(), *layer)) else {
                continue;
            };
            for entry in contributed {
                // Insert before the first node with a strictly greater
                // priority; equal priorities land after existing nodes,
                // which is what gives ancestors precedence at the default.
                let at = entries
                    .iter()
                    .position(|e| e.priority > entry.priority)
                    .unwrap_or(entries.len());
                entries.insert(at, entry.clone());
            }
        }

        if entries.is_empty() {
            debug!("no contributors for event code under lineage {:?}", lineage);
            return None;
        }

        let chain = Arc::new(HandlerChain { entries });
        self.cache
            .lock()
            .expect("registry cache poisoned")
            .insert((code.clone(), concrete), Arc::clone(&chain));
        Some(chain)
    }

    /// Resolve an override by searching the lineage most-derived-first and
    /// returning the first layer that registered `name`.
    pub fn resolve_override(&self, name: &K, lineage: &[LayerId]) -> Option<Handler<Ctx>> {
        lineage
            .iter()
            .rev()
            .find_map(|layer| self.overrides.get(&(name.clone(), *layer)))
            .map(Arc::clone)
    }
}
