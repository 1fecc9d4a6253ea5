//! Actions: the callback / script / shell-command effects a watchpoint or
//! rule dispatches.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use log::{debug, warn};

use crate::error::{CoreError, CoreResult, EntityKind};
use crate::memory::AccessType;
use crate::monitor::{MonitorContext, MonitorEngine};
use crate::rule::RuleEngine;
use crate::sync::ReentrantLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(u32);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Callback,
    Script,
    Command,
}

fn access_type_code(access: AccessType) -> i32 {
    match access {
        AccessType::Read => 0,
        AccessType::Write => 1,
        AccessType::Exec => 2,
    }
}

/// A user-supplied effect, boxed so the registry can store callbacks of any
/// concrete closure type uniformly.
pub type ActionCallback = dyn Fn(&MonitorContext) -> CoreResult<()> + Send + Sync;

enum Payload {
    Callback(Arc<ActionCallback>),
    Script(String),
    Command(String),
}

struct ActionEntry {
    kind: ActionKind,
    payload: Payload,
    user_data: Option<Box<dyn Any + Send + Sync>>,
}

struct State {
    actions: HashMap<ActionId, ActionEntry>,
    next_id: u32,
}

/// Catalog of actions and the executor that runs one given an access
/// context. `SCRIPT`/`COMMAND` actions shell out via [`std::process::Command`]
/// outside this registry's lock, so a long-running external process never
/// blocks other actions from being created or destroyed concurrently.
pub struct ActionRegistry {
    state: ReentrantLock<State>,
    monitor: OnceLock<Arc<MonitorEngine>>,
    rules: OnceLock<Arc<RuleEngine>>,
}

impl ActionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: ReentrantLock::new(State { actions: HashMap::new(), next_id: 1 }),
            monitor: OnceLock::new(),
            rules: OnceLock::new(),
        }
    }

    /// Binds the components `destroy` unbinds a dead action from. Called by
    /// `System::init` once both exist.
    pub(crate) fn bind_dependents(&self, monitor: Arc<MonitorEngine>, rules: Arc<RuleEngine>) {
        let _ = self.monitor.set(monitor);
        let _ = self.rules.set(rules);
    }

    pub fn create_callback<F>(&self, f: F) -> CoreResult<ActionId>
    where
        F: Fn(&MonitorContext) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.insert(ActionKind::Callback, Payload::Callback(Arc::new(f)))
    }

    pub fn create_script(&self, path: impl Into<String>) -> CoreResult<ActionId> {
        let path = path.into();
        if path.is_empty() {
            return Err(CoreError::InvalidArgument("script path must not be empty".into()));
        }
        self.insert(ActionKind::Script, Payload::Script(path))
    }

    pub fn create_command(&self, cmd: impl Into<String>) -> CoreResult<ActionId> {
        let cmd = cmd.into();
        if cmd.is_empty() {
            return Err(CoreError::InvalidArgument("command must not be empty".into()));
        }
        self.insert(ActionKind::Command, Payload::Command(cmd))
    }

    fn insert(&self, kind: ActionKind, payload: Payload) -> CoreResult<ActionId> {
        self.state.with_mut(|s| {
            let id = ActionId(s.next_id);
            s.next_id += 1;
            s.actions.insert(id, ActionEntry { kind, payload, user_data: None });
            debug!("created {id} ({kind:?})");
            Ok(id)
        })
    }

    /// Destroys the action and unbinds it from every watchpoint and rule
    /// that referenced it, so a destroyed action simply stops firing rather
    /// than surfacing `NotFound` from every list that still names it.
    pub fn destroy(&self, id: ActionId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            s.actions
                .remove(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Action, id.to_string()))?;
            Ok::<_, CoreError>(())
        })?;
        if let Some(monitor) = self.monitor.get() {
            monitor.unbind_action_everywhere(id);
        }
        if let Some(rules) = self.rules.get() {
            rules.unbind_action_everywhere(id);
        }
        debug!("destroyed {id}");
        Ok(())
    }

    pub fn get_type(&self, id: ActionId) -> CoreResult<ActionKind> {
        self.state.with(|s| {
            s.actions
                .get(&id)
                .map(|e| e.kind)
                .ok_or_else(|| CoreError::not_found(EntityKind::Action, id.to_string()))
        })
    }

    pub fn set_user_data(&self, id: ActionId, data: Box<dyn Any + Send + Sync>) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let entry = s
                .actions
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Action, id.to_string()))?;
            entry.user_data = Some(data);
            Ok(())
        })
    }

    /// Runs `f` with a reference to the action's user data, if any. Replaces
    /// a plain `get_user_data` accessor, which cannot express a borrow that
    /// outlives the lock guard.
    pub fn with_user_data<R>(&self, id: ActionId, f: impl FnOnce(Option<&dyn Any>) -> R) -> CoreResult<R> {
        self.state.with(|s| {
            let entry = s
                .actions
                .get(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Action, id.to_string()))?;
            Ok(f(entry.user_data.as_deref()))
        })
    }

    /// Executes the action given an access context. Snapshots what it needs
    /// under lock (cloning the callback `Arc` or the script/command
    /// string), then runs it with no registry lock held.
    pub fn execute(&self, id: ActionId, ctx: &MonitorContext) -> CoreResult<()> {
        enum Runnable {
            Callback(Arc<ActionCallback>),
            Script(String),
            Command(String),
        }

        let runnable = self.state.with(|s| {
            let entry = s
                .actions
                .get(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Action, id.to_string()))?;
            Ok::<_, CoreError>(match &entry.payload {
                Payload::Callback(f) => Runnable::Callback(f.clone()),
                Payload::Script(path) => Runnable::Script(path.clone()),
                Payload::Command(cmd) => Runnable::Command(cmd.clone()),
            })
        })?;

        match runnable {
            Runnable::Callback(f) => f(ctx),
            Runnable::Script(path) => {
                let status = Command::new(&path)
                    .arg(ctx.addr.to_string())
                    .arg(ctx.size.to_string())
                    .arg(ctx.value.to_string())
                    .arg(access_type_code(ctx.access_type).to_string())
                    .status()
                    .map_err(|e| CoreError::ActionExecuteFailed { source: Box::new(CoreError::Io(e)) })?;
                if !status.success() {
                    warn!("script action {id} exited with {status}");
                    return Err(CoreError::ActionExecuteFailed {
                        source: Box::new(CoreError::InvalidArgument(format!("script exited with {status}"))),
                    });
                }
                Ok(())
            }
            Runnable::Command(cmd) => {
                let status = run_shell(&cmd)
                    .map_err(|e| CoreError::ActionExecuteFailed { source: Box::new(CoreError::Io(e)) })?;
                if !status.success() {
                    warn!("command action {id} exited with {status}");
                    return Err(CoreError::ActionExecuteFailed {
                        source: Box::new(CoreError::InvalidArgument(format!("command exited with {status}"))),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn run_shell(cmd: &str) -> std::io::Result<std::process::ExitStatus> {
    Command::new("sh").arg("-c").arg(cmd).status()
}

#[cfg(windows)]
fn run_shell(cmd: &str) -> std::io::Result<std::process::ExitStatus> {
    Command::new("cmd").arg("/C").arg(cmd).status()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> MonitorContext {
        MonitorContext {
            region: crate::memory::test_support::fake_region_id(1),
            addr: 0x10,
            size: 4,
            value: 42,
            access_type: AccessType::Write,
        }
    }

    #[test]
    fn callback_action_runs_and_propagates_result() {
        let registry = ActionRegistry::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let id = registry
            .create_callback(move |c| {
                hit2.fetch_add(c.value as usize, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        registry.execute(id, &ctx()).unwrap();
        assert_eq!(hit.load(Ordering::Relaxed), 42);
    }

    #[test]
    fn destroy_unknown_action_not_found() {
        let registry = ActionRegistry::new();
        let err = registry.destroy(ActionId(99));
        assert!(matches!(err, Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn user_data_round_trips() {
        let registry = ActionRegistry::new();
        let id = registry.create_callback(|_| Ok(())).unwrap();
        registry.set_user_data(id, Box::new(7u32)).unwrap();
        let seen = registry
            .with_user_data(id, |data| data.and_then(|d| d.downcast_ref::<u32>().copied()))
            .unwrap();
        assert_eq!(seen, Some(7));
    }

    #[test]
    fn empty_command_rejected() {
        let registry = ActionRegistry::new();
        assert!(matches!(registry.create_command(""), Err(CoreError::InvalidArgument(_))));
    }
}
