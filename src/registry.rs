// Copyright 2020 Joyent, Inc.

//! Named command handlers.
//!
//! Commands are keyed by their full upper-cased name, `DOMAIN::NAME` for
//! namespaced commands or a bare `NAME` otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::app::Session;
use crate::error::Result;
use crate::protocol::{Param, KEY_RETURNMSG};
use crate::server::ServerState;
use crate::store::KeyValueStore;
use crate::template::{TypeTemplate, Value};

pub const DOMAIN_SEPARATOR: &str = "::";

/// Everything a handler can see while it runs one request.
pub struct Call<'a> {
    pub name: &'a str,
    pub params: &'a [Param],
    pub results: &'a KeyValueStore,
    pub session: &'a mut Session,
    pub server: &'a ServerState,
}

impl<'a> Call<'a> {
    pub fn param_text(&self, index: usize) -> Option<String> {
        self.params.get(index).and_then(|p| p.text().ok())
    }

    pub fn param_bytes(&self, index: usize) -> Option<Vec<u8>> {
        self.params.get(index).and_then(|p| p.bytes().ok())
    }

    /// The parameter at `index` laid out by `template`, in local byte order.
    pub fn param_binary(&self, index: usize, template: &TypeTemplate) -> Option<Vec<u8>> {
        let param = self.params.get(index)?;
        self.session.decode_binary(param, template).ok()
    }

    pub fn param_values(&self, index: usize, template: &str) -> Result<Vec<Value>> {
        let template = TypeTemplate::parse(template)?;
        let param = self
            .params
            .get(index)
            .ok_or(crate::template::TemplateError::MissingValue)?;
        self.session.decode_values(param, &template)
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.server.registry()
    }

    /// Records `message` and reports success.
    pub fn ok<M: Into<String>>(&self, message: M) -> bool {
        self.results.insert(KEY_RETURNMSG, message);
        true
    }

    /// Records `message` and reports failure.
    pub fn fail<M: Into<String>>(&self, message: M) -> bool {
        self.results.insert(KEY_RETURNMSG, message);
        false
    }
}

/// A handler fills `call.results` and returns whether the call succeeded;
/// the daemon turns that into the `RETURN` key.
pub type Handler = dyn Fn(&mut Call<'_>) -> bool + Send + Sync;

#[derive(Clone)]
pub struct ProtocolCommand {
    handler: Arc<Handler>,
    pub anonymous: bool,
    pub enabled: bool,
}

impl ProtocolCommand {
    pub fn new<F>(handler: F, anonymous: bool, enabled: bool) -> ProtocolCommand
    where
        F: Fn(&mut Call<'_>) -> bool + Send + Sync + 'static,
    {
        ProtocolCommand {
            handler: Arc::new(handler),
            anonymous,
            enabled,
        }
    }

    pub fn invoke(&self, call: &mut Call<'_>) -> bool {
        (self.handler)(call)
    }
}

pub fn full_name(domain: &str, name: &str) -> String {
    format!(
        "{}{}{}",
        domain.trim().to_ascii_uppercase(),
        DOMAIN_SEPARATOR,
        name.trim().to_ascii_uppercase()
    )
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, ProtocolCommand>>,
}

impl CommandRegistry {
    pub fn new() -> CommandRegistry {
        CommandRegistry::default()
    }

    /// Registers `name`, replacing any command already bound to it.
    pub fn load_command<F>(&self, name: &str, handler: F, anonymous: bool, enabled: bool)
    where
        F: Fn(&mut Call<'_>) -> bool + Send + Sync + 'static,
    {
        self.insert(name, ProtocolCommand::new(handler, anonymous, enabled));
    }

    pub fn insert(&self, name: &str, command: ProtocolCommand) {
        self.commands.write().insert(normalize(name), command);
    }

    /// Registers the anonymous `NAME::USE` and `NAME::HELP` commands.
    pub fn create_domain(&self, name: &str, enabled: bool) {
        let domain = normalize(name);

        let used = domain.clone();
        self.load_command(
            &full_name(&domain, "use"),
            move |call| switch_namespace(call, Some(used.as_str())),
            true,
            enabled,
        );

        let listed = domain.clone();
        self.load_command(
            &full_name(&domain, "help"),
            move |call| {
                let names = call.registry().names_in(Some(listed.as_str()));
                list_commands(call.results, &names);
                true
            },
            true,
            enabled,
        );
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.commands
            .read()
            .contains_key(&full_name(name, "use"))
    }

    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.commands.write().get_mut(&normalize(name)) {
            Some(cmd) => {
                cmd.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ProtocolCommand> {
        self.commands.read().get(&normalize(name)).cloned()
    }

    /// Resolves a request name against the active namespace: an explicit
    /// `DOMAIN::NAME` as given, otherwise an enabled `NAMESPACE::NAME`
    /// before `NAME`. A disabled scoped command does not shadow `NAME`.
    pub fn resolve(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Option<(String, ProtocolCommand)> {
        let name = normalize(name);
        if !name.contains(DOMAIN_SEPARATOR) {
            if let Some(ns) = namespace {
                let scoped = full_name(ns, &name);
                match self.lookup(&scoped) {
                    Some(cmd) if cmd.enabled => return Some((scoped, cmd)),
                    _ => (),
                }
            }
        }
        self.lookup(&name).map(|cmd| (name, cmd))
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted names of enabled commands, optionally limited to a domain.
    pub fn names_in(&self, domain: Option<&str>) -> Vec<String> {
        let prefix = domain.map(|d| format!("{}{}", normalize(d), DOMAIN_SEPARATOR));
        let mut names: Vec<String> = self
            .commands
            .read()
            .iter()
            .filter(|(_, cmd)| cmd.enabled)
            .filter(|(name, _)| match &prefix {
                Some(p) => name.starts_with(p.as_str()),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Switches the session to the domain named by the first parameter, or
/// to `fallback` when there is none. A `None` fallback clears the
/// namespace.
pub fn switch_namespace(call: &mut Call<'_>, fallback: Option<&str>) -> bool {
    let requested = call.param_text(0).filter(|d| !d.trim().is_empty());
    let domain = match (requested, fallback) {
        (Some(d), _) => normalize(&d),
        (None, Some(d)) => normalize(d),
        (None, None) => {
            call.session.namespace = None;
            return call.ok("Namespace cleared");
        }
    };
    if !call.registry().has_domain(&domain) {
        return call.fail(format!("Unknown domain {}", domain));
    }
    let message = format!("Using {}", domain);
    call.session.namespace = Some(domain);
    call.ok(message)
}

/// Writes `names` as `COMMAND.<n>` entries plus a `COUNT`.
pub fn list_commands(results: &KeyValueStore, names: &[String]) {
    for (i, name) in names.iter().enumerate() {
        results.insert(&format!("COMMAND.{}", i), name.as_str());
    }
    results.insert("COUNT", names.len().to_string());
}
