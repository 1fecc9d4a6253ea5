//! Named rules: a predicate gating an ordered action list.
//!
//! Rules are a layered abstraction on top of actions, not an interception
//! point — `MonitorEngine` never evaluates a rule on its own. Client code
//! (typically a watchpoint's bound callback) calls `evaluate` explicitly.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::action::{ActionId, ActionRegistry};
use crate::error::{CoreError, CoreResult, EntityKind};
use crate::monitor::MonitorContext;
use crate::sync::ReentrantLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(u32);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rule#{}", self.0)
    }
}

pub type RulePredicate = dyn Fn(&MonitorContext) -> bool + Send + Sync;

struct RuleEntry {
    name: String,
    predicate: Option<Arc<RulePredicate>>,
    actions: Vec<ActionId>,
    enabled: bool,
    user_data: Option<Box<dyn Any + Send + Sync>>,
}

struct State {
    rules: HashMap<RuleId, RuleEntry>,
    by_name: HashMap<String, RuleId>,
    next_id: u32,
    max_actions_per_eval: usize,
}

/// Catalog of rules and the evaluator that gates a bounded action list on a
/// predicate.
pub struct RuleEngine {
    state: ReentrantLock<State>,
    actions: Arc<ActionRegistry>,
}

impl RuleEngine {
    pub(crate) fn new(actions: Arc<ActionRegistry>, max_actions_per_eval: usize) -> Self {
        Self {
            state: ReentrantLock::new(State {
                rules: HashMap::new(),
                by_name: HashMap::new(),
                next_id: 1,
                max_actions_per_eval: max_actions_per_eval.max(1),
            }),
            actions,
        }
    }

    /// Creates a rule, disabled and predicate-less by default.
    pub fn create(&self, name: &str) -> CoreResult<RuleId> {
        if name.is_empty() {
            return Err(CoreError::InvalidArgument("rule name must not be empty".into()));
        }
        self.state.with_mut(|s| {
            if s.by_name.contains_key(name) {
                return Err(CoreError::already_exists(EntityKind::Rule, name));
            }
            let id = RuleId(s.next_id);
            s.next_id += 1;
            s.rules.insert(
                id,
                RuleEntry {
                    name: name.to_string(),
                    predicate: None,
                    actions: Vec::new(),
                    enabled: false,
                    user_data: None,
                },
            );
            s.by_name.insert(name.to_string(), id);
            debug!("created {id} ({name})");
            Ok(id)
        })
    }

    pub fn destroy(&self, id: RuleId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let entry = s
                .rules
                .remove(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            s.by_name.remove(&entry.name);
            Ok(())
        })
    }

    pub fn enable(&self, id: RuleId) -> CoreResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: RuleId) -> CoreResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: RuleId, enabled: bool) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let entry = s
                .rules
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            entry.enabled = enabled;
            Ok(())
        })
    }

    pub fn set_condition<F>(&self, id: RuleId, predicate: F) -> CoreResult<()>
    where
        F: Fn(&MonitorContext) -> bool + Send + Sync + 'static,
    {
        self.state.with_mut(|s| {
            let entry = s
                .rules
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            entry.predicate = Some(Arc::new(predicate));
            Ok(())
        })
    }

    pub fn add_action(&self, id: RuleId, action: ActionId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let entry = s
                .rules
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            if !entry.actions.contains(&action) {
                entry.actions.push(action);
            }
            Ok(())
        })
    }

    pub fn remove_action(&self, id: RuleId, action: ActionId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let entry = s
                .rules
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            entry.actions.retain(|&a| a != action);
            Ok(())
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<RuleId> {
        self.state.with(|s| s.by_name.get(name).copied())
    }

    pub fn get_name(&self, id: RuleId) -> CoreResult<String> {
        self.state.with(|s| {
            s.rules
                .get(&id)
                .map(|e| e.name.clone())
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))
        })
    }

    pub fn set_user_data(&self, id: RuleId, data: Box<dyn Any + Send + Sync>) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let entry = s
                .rules
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            entry.user_data = Some(data);
            Ok(())
        })
    }

    pub fn with_user_data<R>(&self, id: RuleId, f: impl FnOnce(Option<&dyn Any>) -> R) -> CoreResult<R> {
        self.state.with(|s| {
            let entry = s
                .rules
                .get(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            Ok(f(entry.user_data.as_deref()))
        })
    }

    /// Unbinds `action` from every rule that references it. Called by
    /// `ActionRegistry::destroy`.
    pub(crate) fn unbind_action_everywhere(&self, action: ActionId) {
        self.state.with_mut(|s| {
            for entry in s.rules.values_mut() {
                entry.actions.retain(|&a| a != action);
            }
        });
    }

    /// Evaluates the rule: no-ops if disabled or predicate-less; otherwise
    /// snapshots the bounded action list under lock, evaluates the
    /// predicate unlocked, and on a true result executes each action in
    /// order, stopping at (and wrapping) the first failure.
    pub fn evaluate(&self, id: RuleId, ctx: &MonitorContext) -> CoreResult<()> {
        struct Snapshot {
            name: String,
            predicate: Arc<RulePredicate>,
            actions: Vec<ActionId>,
        }

        let snapshot = self.state.with(|s| {
            let entry = s
                .rules
                .get(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Rule, id.to_string()))?;
            if !entry.enabled {
                return Ok(None);
            }
            let Some(predicate) = entry.predicate.clone() else {
                return Ok(None);
            };
            let actions = entry.actions.iter().take(s.max_actions_per_eval).copied().collect();
            if entry.actions.len() > s.max_actions_per_eval {
                warn!(
                    "rule {} has {} bound actions, evaluating only the first {}",
                    entry.name,
                    entry.actions.len(),
                    s.max_actions_per_eval
                );
            }
            Ok(Some(Snapshot { name: entry.name.clone(), predicate, actions }))
        })?;

        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        if !(snapshot.predicate)(ctx) {
            return Ok(());
        }

        for action in snapshot.actions {
            self.actions.execute(action, ctx).map_err(|source| CoreError::RuleActionFailed {
                rule: snapshot.name.clone(),
                source: Box::new(source),
            })?;
        }
        Ok(())
    }
}
