//! Module: a bound registry of action definitions plus their handlers.
//!
//! Construction flattens an action group into a registry keyed by action
//! name, and records which flattened path produced which name. Handlers are
//! attached afterwards from a tree mirroring the group's shape — each leaf is
//! matched to its action through the path map, so the handler tree never
//! repeats action names. Registering a handler for a path the group never
//! produced is a fatal shape mismatch.

use crate::action::{
    flatten_group, flatten_handlers, ActionDef, ActionHandler, ActionNode, HandlerNode,
};
use crate::error::{ActionError, ActionResult};
use std::collections::HashMap;

/// A registry entry: the definition plus its optional handler.
#[derive(Clone)]
pub struct ModuleAction {
    /// The action definition.
    pub def: ActionDef,
    /// The registered handler, if any.
    pub handler: Option<ActionHandler>,
}

impl std::fmt::Debug for ModuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleAction")
            .field("def", &self.def)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// A named collection of action definitions with attached handlers.
#[derive(Debug)]
pub struct Module {
    name: String,
    actions: HashMap<String, ModuleAction>,
    /// Flattened group path → action name, fixed at construction.
    action_keys: HashMap<String, String>,
    /// Action names whose settings carry a cron interval.
    crons: Vec<String>,
}

impl Module {
    /// Create a module by flattening the given action group.
    #[must_use]
    pub fn new(name: impl Into<String>, group: &ActionNode) -> Self {
        let mut actions = HashMap::new();
        let mut action_keys = HashMap::new();
        let mut crons = Vec::new();

        for (path, def) in flatten_group(group) {
            if def.cron().is_some() {
                crons.push(def.name().to_string());
            }
            action_keys.insert(path, def.name().to_string());
            actions.insert(
                def.name().to_string(),
                ModuleAction { def, handler: None },
            );
        }

        Self {
            name: name.into(),
            actions,
            action_keys,
            crons,
        }
    }

    /// The module's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach handlers from a tree mirroring the action group's shape.
    ///
    /// Partial trees are fine — only the provided leaves are attached.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::UnknownHandlerPath`] when a leaf's path has no
    /// corresponding action definition (a mismatched handler tree shape).
    pub fn register_handlers(&mut self, tree: HandlerNode) -> ActionResult<()> {
        for (path, handler) in flatten_handlers(tree) {
            let Some(action_name) = self.action_keys.get(&path) else {
                return Err(ActionError::UnknownHandlerPath(path));
            };
            let Some(entry) = self.actions.get_mut(action_name) else {
                return Err(ActionError::UnknownHandlerPath(path));
            };
            entry.handler = Some(handler);
        }
        Ok(())
    }

    /// Look up the handler registered for a definition. O(1) by name.
    #[must_use]
    pub fn get_handler(&self, def: &ActionDef) -> Option<ActionHandler> {
        self.actions
            .get(def.name())
            .and_then(|entry| entry.handler.clone())
    }

    /// Detach every handler, keeping the definitions. Used between test
    /// cases.
    pub fn clear_handlers(&mut self) {
        for entry in self.actions.values_mut() {
            entry.handler = None;
        }
    }

    /// The registry entries, keyed by action name.
    #[must_use]
    pub const fn actions(&self) -> &HashMap<String, ModuleAction> {
        &self.actions
    }

    /// Action names flagged cron-eligible at construction.
    #[must_use]
    pub fn crons(&self) -> &[String] {
        &self.crons
    }
}
