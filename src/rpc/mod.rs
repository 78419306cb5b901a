// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! JSON commands as seen by the node: completion contract and the command
//! table. Reading requests off a socket is left to the caller.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// Generic failure of a command.
pub const ERROR_GENERIC: i32 = -1;
pub const JSONRPC2_INVALID_PARAMS: i32 = -32602;
pub const JSONRPC2_METHOD_NOT_FOUND: i32 = -32601;

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(crate = "serde_crate")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// JSON-RPC 2.0 response object.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(crate = "serde_crate")]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|err| err.message.as_str())
    }
}

/// A command in flight. It is completed exactly once, by [`Command::success`]
/// or [`Command::fail`], both of which consume it.
#[derive(Debug)]
pub struct Command {
    id: Value,
    method: String,
    reply: Option<oneshot::Sender<Response>>,
    pending: bool,
}

impl Command {
    pub fn new(id: Value, method: impl ToString) -> (Command, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let cmd = Command { id, method: method.to_string(), reply: Some(tx), pending: false };
        (cmd, rx)
    }

    pub fn id(&self) -> &Value { &self.id }

    pub fn method(&self) -> &str { &self.method }

    /// Marks the command as completed later, from some asynchronous path.
    pub fn still_pending(&mut self) { self.pending = true }

    pub fn is_pending(&self) -> bool { self.pending }

    pub fn success(mut self, result: Value) {
        debug!("Command {} succeeded", self.method);
        self.complete(Some(result), None);
    }

    pub fn fail(mut self, code: i32, message: impl ToString) {
        let message = message.to_string();
        debug!("Command {} failed: {}", self.method, message);
        self.complete(None, Some(RpcError { code, message }));
    }

    fn complete(&mut self, result: Option<Value>, error: Option<RpcError>) {
        let Some(reply) = self.reply.take() else { return };
        let response = Response { jsonrpc: "2.0", id: self.id.take(), result, error };
        if reply.send(response).is_err() {
            debug!("Connection for command {} is gone, dropping the response", self.method);
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if self.reply.is_some() {
            warn!("Command {} was dropped without a response", self.method);
            self.complete(None, Some(RpcError { code: ERROR_GENERIC, message: s!("command abandoned") }));
        }
    }
}

/// Handler bound to a command name; `C` is the node state it runs against.
pub type CommandHandler<C> = fn(&mut C, Command, Value);

pub struct JsonCommand<C> {
    pub name: &'static str,
    pub handler: CommandHandler<C>,
    pub description: &'static str,
    pub verbose: Option<&'static str>,
}

/// Ordered command table, built once at startup.
pub struct CommandTable<C> {
    commands: Vec<JsonCommand<C>>,
}

impl<C> Default for CommandTable<C> {
    fn default() -> Self { CommandTable { commands: vec![] } }
}

impl<C> CommandTable<C> {
    pub fn new() -> Self { CommandTable::default() }

    /// # Panics
    ///
    /// If a command with the same name is already registered.
    pub fn with(mut self, command: JsonCommand<C>) -> Self {
        assert!(self.find(command.name).is_none(), "command {} registered twice", command.name);
        self.commands.push(command);
        self
    }

    pub fn find(&self, name: &str) -> Option<&JsonCommand<C>> {
        self.commands.iter().find(|cmd| cmd.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.iter().map(|cmd| cmd.name)
    }

    pub fn dispatch(&self, ctx: &mut C, cmd: Command, params: Value) {
        match self.find(cmd.method()) {
            Some(json_cmd) => {
                trace!("Dispatching {} with {}", json_cmd.name, params);
                (json_cmd.handler)(ctx, cmd, params)
            }
            None => {
                let msg = format!("Unknown command '{}'", cmd.method());
                cmd.fail(JSONRPC2_METHOD_NOT_FOUND, msg)
            }
        }
    }

    /// Either the list of commands or the verbose description of one.
    pub fn help(&self, command: Option<&str>) -> Result<Value, String> {
        match command {
            Some(name) => {
                let cmd = self.find(name).ok_or_else(|| format!("Unknown command '{}'", name))?;
                let verbose = cmd.verbose.unwrap_or("HELP! Please contribute a description for this command!");
                Ok(json!({ "verbose": verbose }))
            }
            None => {
                let list: Vec<Value> = self
                    .commands
                    .iter()
                    .map(|cmd| json!({ "command": cmd.name, "description": cmd.description }))
                    .collect();
                Ok(json!({ "help": list }))
            }
        }
    }
}

/// Parameter given either by position or by name.
pub fn param<'a>(params: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    let value = match params {
        Value::Array(list) => list.get(index),
        Value::Object(map) => map.get(name),
        _ => None,
    };
    value.filter(|value| !value.is_null())
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Counter {
        calls: usize,
    }

    fn bump(ctx: &mut Counter, cmd: Command, params: Value) {
        ctx.calls += 1;
        cmd.success(params)
    }

    fn table() -> CommandTable<Counter> {
        CommandTable::new()
            .with(JsonCommand {
                name: "bump",
                handler: bump,
                description: "Count a call",
                verbose: Some("bump [anything]\nEchoes its parameters."),
            })
            .with(JsonCommand { name: "quiet", handler: bump, description: "Undocumented", verbose: None })
    }

    #[test]
    fn dispatch_reaches_handler() {
        let mut ctx = Counter::default();
        let (cmd, mut rx) = Command::new(json!(1), "bump");
        table().dispatch(&mut ctx, cmd, json!(["x"]));
        assert_eq!(ctx.calls, 1);
        let response = rx.try_recv().unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "jsonrpc": "2.0", "id": 1, "result": ["x"] })
        );
    }

    #[test]
    fn unknown_method() {
        let (cmd, mut rx) = Command::new(json!("a"), "nope");
        table().dispatch(&mut Counter::default(), cmd, Value::Null);
        let response = rx.try_recv().unwrap();
        assert_eq!(response.error.unwrap().code, JSONRPC2_METHOD_NOT_FOUND);
    }

    #[test]
    fn help_lists_or_describes() {
        let table = table();
        let list = table.help(None).unwrap();
        assert_eq!(list["help"][0]["command"], "bump");
        assert_eq!(list["help"][1]["description"], "Undocumented");
        assert_eq!(table.help(Some("bump")).unwrap()["verbose"], "bump [anything]\nEchoes its parameters.");
        assert!(table.help(Some("quiet")).unwrap()["verbose"].as_str().unwrap().starts_with("HELP!"));
        assert_eq!(table.help(Some("other")), Err(s!("Unknown command 'other'")));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_names_panic() {
        table().with(JsonCommand { name: "bump", handler: bump, description: "", verbose: None });
    }

    #[test]
    fn dropped_command_still_answers() {
        let (mut cmd, mut rx) = Command::new(json!(9), "fundchannel");
        cmd.still_pending();
        assert!(cmd.is_pending());
        drop(cmd);
        assert_eq!(rx.try_recv().unwrap().error_message(), Some("command abandoned"));
    }

    #[test]
    fn closed_connection_is_tolerated() {
        let (cmd, rx) = Command::new(json!(2), "stop");
        drop(rx);
        cmd.success(json!("Shutting down"));
    }

    #[test]
    fn params_by_position_or_name() {
        assert_eq!(param(&json!(["a", null]), 0, "id"), Some(&json!("a")));
        assert_eq!(param(&json!(["a", null]), 1, "amount"), None);
        assert_eq!(param(&json!({ "id": "b" }), 0, "id"), Some(&json!("b")));
        assert_eq!(param(&Value::Null, 0, "id"), None);
    }
}
