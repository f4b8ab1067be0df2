//! Command layer seam.
//!
//! The session manager forwards every request line (or batched command
//! list) to a [`CommandExecutor`]. The real player/playlist/database
//! subsystems live behind this trait; the built-in [`CommandDispatcher`]
//! implements the session-level verbs and the error ACK framing so the
//! daemon is usable (and testable) on its own.

use crate::client::Client;
use crate::idle;
use crate::listener::Stream;
use crate::permission::{PERMISSION_ADMIN, PERMISSION_NONE, PERMISSION_READ};

/// Outcome of executing one command or one command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    /// Completed; the session layer appends the success terminator.
    Ok,
    /// The response is already complete (an error ACK, or an idle wait
    /// that produces no immediate terminator).
    Handled,
    /// Close this client's connection.
    Close,
    /// Shut the whole daemon down.
    Kill,
}

/// The command interpreter consumed by the session layer.
///
/// Implementations append their reply bytes to the client's staging buffer
/// through [`Client::write`] and friends; the session layer flushes after
/// each call.
pub trait CommandExecutor: Send + Sync {
    /// Execute a single request line.
    fn process(&self, client: &mut Client, sock: &Stream, line: &str) -> CommandResult;

    /// Execute a batched command list in arrival order. With `with_acks`,
    /// each successful step is acknowledged with `list_OK`.
    fn process_list(
        &self,
        client: &mut Client,
        sock: &Stream,
        with_acks: bool,
        lines: &[String],
    ) -> CommandResult;
}

/// Append the command success terminator.
pub fn command_success(client: &mut Client, sock: &Stream) {
    client.puts(sock, "OK\n");
}

/// Append the per-item acknowledgment used inside `command_list_ok` mode.
pub fn command_list_item_success(client: &mut Client, sock: &Stream) {
    client.puts(sock, "list_OK\n");
}

// Protocol error codes carried in ACK responses.
pub const ACK_ERROR_NOT_LIST: u32 = 1;
pub const ACK_ERROR_ARG: u32 = 2;
pub const ACK_ERROR_PASSWORD: u32 = 3;
pub const ACK_ERROR_PERMISSION: u32 = 4;
pub const ACK_ERROR_UNKNOWN: u32 = 5;

/// Append a protocol error: `ACK [<code>@<index>] {<command>} <message>`.
///
/// `index` is the offending command's position within a command list, 0
/// outside of lists.
pub fn ack(
    client: &mut Client,
    sock: &Stream,
    code: u32,
    index: usize,
    command: &str,
    message: &str,
) {
    client.write_args(
        sock,
        format_args!("ACK [{code}@{index}] {{{command}}} {message}\n"),
    );
}

type Handler = fn(&mut Client, &Stream, &[&str], usize) -> CommandResult;

/// Verbs that must not appear inside a command list: `idle` would block
/// mid-batch, and lists do not nest.
const NOT_IN_LIST: &[&str] = &["idle", "command_list_begin", "command_list_ok_begin"];

struct CommandDef {
    name: &'static str,
    permission: u32,
    min_args: usize,
    max_args: Option<usize>,
    handler: Handler,
}

const COMMANDS: &[CommandDef] = &[
    CommandDef {
        name: "close",
        permission: PERMISSION_NONE,
        min_args: 0,
        max_args: Some(0),
        handler: handle_close,
    },
    CommandDef {
        name: "idle",
        permission: PERMISSION_READ,
        min_args: 0,
        max_args: None,
        handler: handle_idle,
    },
    CommandDef {
        name: "kill",
        permission: PERMISSION_ADMIN,
        min_args: 0,
        max_args: Some(0),
        handler: handle_kill,
    },
    CommandDef {
        name: "ping",
        permission: PERMISSION_NONE,
        min_args: 0,
        max_args: Some(0),
        handler: handle_ping,
    },
];

fn handle_ping(_client: &mut Client, _sock: &Stream, _args: &[&str], _index: usize) -> CommandResult {
    CommandResult::Ok
}

fn handle_close(_client: &mut Client, _sock: &Stream, _args: &[&str], _index: usize) -> CommandResult {
    CommandResult::Close
}

fn handle_kill(_client: &mut Client, _sock: &Stream, _args: &[&str], _index: usize) -> CommandResult {
    CommandResult::Kill
}

fn handle_idle(client: &mut Client, sock: &Stream, args: &[&str], index: usize) -> CommandResult {
    let mask = match idle::subscription_mask(args) {
        Ok(mask) => mask,
        Err(bad) => {
            let message = format!("Unrecognized idle event: {bad}");
            ack(client, sock, ACK_ERROR_ARG, index, "idle", &message);
            return CommandResult::Handled;
        }
    };

    // Whether notification was delivered synchronously or the client is now
    // blocked, there is nothing further to emit here: idle_wait has already
    // written the full response in the synchronous case.
    client.idle_wait(sock, mask);
    CommandResult::Handled
}

/// Built-in command interpreter: session-level verbs plus ACK errors.
#[derive(Debug, Default)]
pub struct CommandDispatcher;

impl CommandDispatcher {
    pub fn new() -> Self {
        Self
    }

    fn lookup(name: &str) -> Option<&'static CommandDef> {
        COMMANDS.iter().find(|def| def.name == name)
    }

    fn run(
        &self,
        client: &mut Client,
        sock: &Stream,
        line: &str,
        index: usize,
        in_list: bool,
    ) -> CommandResult {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            ack(client, sock, ACK_ERROR_UNKNOWN, index, "", "No command given");
            return CommandResult::Handled;
        };
        let args: Vec<&str> = parts.collect();

        if in_list && NOT_IN_LIST.contains(&verb) {
            let message = format!("command \"{verb}\" not allowed in command lists");
            ack(client, sock, ACK_ERROR_NOT_LIST, index, verb, &message);
            return CommandResult::Handled;
        }

        let Some(def) = Self::lookup(verb) else {
            let message = format!("unknown command \"{verb}\"");
            ack(client, sock, ACK_ERROR_UNKNOWN, index, "", &message);
            return CommandResult::Handled;
        };

        if client.permission() & def.permission != def.permission {
            let message = format!("you don't have permission for \"{}\"", def.name);
            ack(client, sock, ACK_ERROR_PERMISSION, index, def.name, &message);
            return CommandResult::Handled;
        }

        if args.len() < def.min_args || def.max_args.is_some_and(|max| args.len() > max) {
            let message = format!("wrong number of arguments for \"{}\"", def.name);
            ack(client, sock, ACK_ERROR_ARG, index, def.name, &message);
            return CommandResult::Handled;
        }

        (def.handler)(client, sock, &args, index)
    }
}

impl CommandExecutor for CommandDispatcher {
    fn process(&self, client: &mut Client, sock: &Stream, line: &str) -> CommandResult {
        self.run(client, sock, line, 0, false)
    }

    fn process_list(
        &self,
        client: &mut Client,
        sock: &Stream,
        with_acks: bool,
        lines: &[String],
    ) -> CommandResult {
        for (index, line) in lines.iter().enumerate() {
            tracing::debug!(client = client.num(), index, line = %line, "list command");
            match self.run(client, sock, line, index, true) {
                CommandResult::Ok => {
                    if with_acks {
                        command_list_item_success(client, sock);
                    }
                }
                other => return other,
            }
        }
        CommandResult::Ok
    }
}
