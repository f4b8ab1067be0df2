//! Per-connection client session.
//!
//! A `Client` owns everything one connection needs: the fixed inbound
//! buffer and line framer, the outbound staging buffer, the deferred
//! output queue for slow peers, command-list accumulation, idle/notify
//! state, identity and permissions. All methods are non-blocking; socket
//! access goes through `try_read`/`try_write` on the [`Stream`] handed in
//! by the session task.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::command::{command_success, CommandExecutor, CommandResult};
use crate::config::Limits;
use crate::deferred::DeferredQueue;
use crate::idle;
use crate::listener::Stream;

/// Size of the fixed inbound buffer; also the maximum request line length.
pub const INPUT_BUFFER_SIZE: usize = 4096;

/// Size of the outbound staging buffer.
pub const OUTPUT_STAGING_SIZE: usize = 4096;

const LIST_MODE_BEGIN: &str = "command_list_begin";
const LIST_OK_MODE_BEGIN: &str = "command_list_ok_begin";
const LIST_MODE_END: &str = "command_list_end";

/// What the session task should do with the connection after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Continue,
    /// Drop this session.
    Close,
    /// Tear the whole daemon down.
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandListMode {
    Off,
    /// Collecting; one terminator after the whole list.
    Plain,
    /// Collecting; `list_OK` after each step plus the final terminator.
    WithAcks,
}

pub struct Client {
    num: u64,
    uid: Option<u32>,
    permission: u32,
    expired: bool,

    buffer: [u8; INPUT_BUFFER_SIZE],
    /// Length of the filled prefix of `buffer`.
    filled: usize,
    /// Offset of the first unprocessed byte; `consumed <= filled`.
    consumed: usize,

    send_buf: [u8; OUTPUT_STAGING_SIZE],
    send_buf_used: usize,
    deferred: DeferredQueue,

    list_mode: CommandListMode,
    list: Vec<String>,
    list_size: usize,

    idle_waiting: bool,
    idle_flags: u32,
    idle_subscriptions: u32,

    last_activity: Instant,

    max_command_list_size: usize,
    max_output_buffer_size: usize,
}

impl Client {
    pub fn new(num: u64, uid: Option<u32>, permission: u32, limits: Limits) -> Self {
        Self {
            num,
            uid,
            permission,
            expired: false,
            buffer: [0; INPUT_BUFFER_SIZE],
            filled: 0,
            consumed: 0,
            send_buf: [0; OUTPUT_STAGING_SIZE],
            send_buf_used: 0,
            deferred: DeferredQueue::new(),
            list_mode: CommandListMode::Off,
            list: Vec::new(),
            list_size: 0,
            idle_waiting: false,
            idle_flags: 0,
            idle_subscriptions: 0,
            last_activity: Instant::now(),
            max_command_list_size: limits.max_command_list_size,
            max_output_buffer_size: limits.max_output_buffer_size,
        }
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    /// The peer process's uid, when the transport could resolve one.
    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    pub fn permission(&self) -> u32 {
        self.permission
    }

    pub fn set_permission(&mut self, permission: u32) {
        self.permission = permission;
    }

    /// An expired session performs no further I/O; the manager sweep (or
    /// the owning task) detaches it.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn set_expired(&mut self) {
        self.expired = true;
    }

    pub fn is_idle_waiting(&self) -> bool {
        self.idle_waiting
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn deferred_is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Accounted size of the deferred queue, for limit checks and tests.
    pub fn deferred_bytes(&self) -> usize {
        self.deferred.bytes()
    }

    // ---- input path -------------------------------------------------------

    /// One read step: pull whatever the socket has ready into the inbound
    /// buffer and process every complete line.
    pub fn read_step(&mut self, sock: &Stream, executor: &dyn CommandExecutor) -> SessionAction {
        debug_assert!(self.consumed <= self.filled);
        debug_assert!(self.filled < INPUT_BUFFER_SIZE);

        match sock.try_read(&mut self.buffer[self.filled..]) {
            Ok(0) => SessionAction::Close,
            Ok(n) => {
                self.touch();
                self.input_received(sock, executor, n)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                // The retry still counts as activity for the inactivity
                // timeout, matching the sweep's contract that only sessions
                // making no progress at all are closed.
                self.touch();
                SessionAction::Continue
            }
            Err(_) => SessionAction::Close,
        }
    }

    /// Frame and process the lines completed by `n` freshly read bytes.
    fn input_received(
        &mut self,
        sock: &Stream,
        executor: &dyn CommandExecutor,
        n: usize,
    ) -> SessionAction {
        self.filled += n;
        debug_assert!(self.filled <= INPUT_BUFFER_SIZE);

        while let Some(pos) = self.buffer[self.consumed..self.filled]
            .iter()
            .position(|&b| b == b'\n')
        {
            let start = self.consumed;
            let newline = start + pos;
            let end = if newline > start && self.buffer[newline - 1] == b'\r' {
                newline - 1
            } else {
                newline
            };

            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            self.consumed = newline + 1;

            let action = self.process_line(sock, executor, &line);
            if action != SessionAction::Continue {
                return action;
            }
            if self.expired {
                return SessionAction::Close;
            }
        }

        if self.filled == INPUT_BUFFER_SIZE {
            if self.consumed == 0 {
                tracing::error!(client = self.num, "buffer overflow");
                return SessionAction::Close;
            }
            // Close the gap so the next read has room for the rest of the
            // partial line.
            self.buffer.copy_within(self.consumed..self.filled, 0);
            self.filled -= self.consumed;
            self.consumed = 0;
        }

        SessionAction::Continue
    }

    /// Process one request line against the three session modes:
    /// idle-waiting, list-accumulating, normal.
    fn process_line(
        &mut self,
        sock: &Stream,
        executor: &dyn CommandExecutor,
        line: &str,
    ) -> SessionAction {
        if line == "noidle" {
            if self.idle_waiting {
                // Empty idle response; back to normal mode.
                self.idle_waiting = false;
                command_success(self, sock);
                self.write_output(sock);
            }
            // Otherwise the client already received its idle payload from a
            // notification and this is a harmless no-op.
            return SessionAction::Continue;
        }

        if self.idle_waiting {
            // During idle, clients must not send anything but "noidle".
            tracing::error!(client = self.num, line, "command during idle");
            return SessionAction::Close;
        }

        if self.list_mode != CommandListMode::Off {
            if line == LIST_MODE_END {
                let lines = std::mem::take(&mut self.list);
                let with_acks = self.list_mode == CommandListMode::WithAcks;
                tracing::debug!(client = self.num, len = lines.len(), "process command list");

                let ret = executor.process_list(self, sock, with_acks, &lines);
                if ret == CommandResult::Close || self.expired {
                    return SessionAction::Close;
                }
                if ret == CommandResult::Ok {
                    command_success(self, sock);
                }
                self.write_output(sock);

                self.list_mode = CommandListMode::Off;
                self.list_size = 0;

                if ret == CommandResult::Kill {
                    return SessionAction::Kill;
                }
            } else {
                self.list_size += line.len() + 1;
                if self.list_size > self.max_command_list_size {
                    tracing::error!(
                        client = self.num,
                        size = self.list_size,
                        max = self.max_command_list_size,
                        "command list too large"
                    );
                    return SessionAction::Close;
                }
                self.list.push(line.to_owned());
            }
        } else if line == LIST_MODE_BEGIN {
            self.list_mode = CommandListMode::Plain;
        } else if line == LIST_OK_MODE_BEGIN {
            self.list_mode = CommandListMode::WithAcks;
        } else {
            tracing::debug!(client = self.num, line, "process command");

            let ret = executor.process(self, sock, line);
            if ret == CommandResult::Close || self.expired {
                return SessionAction::Close;
            }
            if ret == CommandResult::Ok {
                command_success(self, sock);
            }
            self.write_output(sock);

            if ret == CommandResult::Kill {
                return SessionAction::Kill;
            }
        }

        SessionAction::Continue
    }

    // ---- output path ------------------------------------------------------

    /// Append reply bytes to the staging buffer, flushing whenever it
    /// fills. Silently discards everything once the session is expired.
    pub fn write(&mut self, sock: &Stream, mut data: &[u8]) {
        while !data.is_empty() && !self.expired {
            debug_assert!(self.send_buf_used < OUTPUT_STAGING_SIZE);

            let room = OUTPUT_STAGING_SIZE - self.send_buf_used;
            let n = room.min(data.len());
            self.send_buf[self.send_buf_used..self.send_buf_used + n]
                .copy_from_slice(&data[..n]);
            self.send_buf_used += n;
            data = &data[n..];

            if self.send_buf_used >= OUTPUT_STAGING_SIZE {
                self.write_output(sock);
            }
        }
    }

    /// Append a string to the staging buffer.
    pub fn puts(&mut self, sock: &Stream, s: &str) {
        self.write(sock, s.as_bytes());
    }

    /// Append formatted text to the staging buffer.
    pub fn write_args(&mut self, sock: &Stream, args: fmt::Arguments<'_>) {
        self.write(sock, args.to_string().as_bytes());
    }

    /// Flush the staging buffer: enqueue behind any pending deferred output
    /// (order is preserved), otherwise attempt one direct write with the
    /// unwritten remainder deferred.
    pub fn write_output(&mut self, sock: &Stream) {
        if self.expired || self.send_buf_used == 0 {
            return;
        }

        let used = self.send_buf_used;
        if !self.deferred.is_empty() {
            let data = Bytes::copy_from_slice(&self.send_buf[..used]);
            self.defer_output(data);

            // Try to flush now; the current command may take a while to
            // finish, and meanwhile the peer would otherwise sit on a
            // growing queue until the next writable wakeup.
            if !self.expired {
                self.write_deferred(sock);
            }
        } else {
            self.write_direct(sock, used);
        }

        self.send_buf_used = 0;
    }

    fn write_direct(&mut self, sock: &Stream, len: usize) {
        debug_assert!(len > 0);
        debug_assert!(self.deferred.is_empty());

        match sock.try_write(&self.send_buf[..len]) {
            Ok(n) if n < len => {
                let rest = Bytes::copy_from_slice(&self.send_buf[n..len]);
                self.defer_output(rest);
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                let all = Bytes::copy_from_slice(&self.send_buf[..len]);
                self.defer_output(all);
            }
            Err(e) => {
                tracing::debug!(client = self.num, error = %e, "write failed");
                self.set_expired();
                return;
            }
        }

        if !self.deferred.is_empty() {
            tracing::debug!(client = self.num, "deferred buffer created");
        }
    }

    fn defer_output(&mut self, data: Bytes) {
        if !self.deferred.enqueue(data, self.max_output_buffer_size) {
            tracing::error!(
                client = self.num,
                bytes = self.deferred.bytes(),
                max = self.max_output_buffer_size,
                "output buffer full"
            );
            self.set_expired();
        }
    }

    /// Drain the deferred queue as far as the socket accepts. Hard write
    /// errors expire the session.
    pub fn write_deferred(&mut self, sock: &Stream) {
        match self.deferred.drain(|chunk| sock.try_write(chunk)) {
            Ok(written) => {
                if written > 0 {
                    self.touch();
                }
                if self.deferred.is_empty() {
                    tracing::debug!(client = self.num, "deferred buffer empty");
                }
            }
            Err(e) => {
                tracing::debug!(client = self.num, error = %e, "flushing deferred output failed");
                self.set_expired();
            }
        }
    }

    // ---- idle -------------------------------------------------------------

    /// Enter idle mode with the given subscription mask. If a subscribed
    /// event is already pending it is delivered immediately and `true` is
    /// returned; otherwise the client is now blocked awaiting a raise.
    pub fn idle_wait(&mut self, sock: &Stream, subscriptions: u32) -> bool {
        debug_assert!(!self.idle_waiting);

        self.idle_waiting = true;
        self.idle_subscriptions = subscriptions;

        if self.idle_flags & self.idle_subscriptions != 0 {
            self.idle_notify(sock);
            true
        } else {
            false
        }
    }

    /// Record raised event flags; deliver right away if this client is
    /// blocked in idle and the raise intersects its subscriptions.
    pub fn idle_add(&mut self, sock: &Stream, flags: u32) {
        self.idle_flags |= flags;
        if self.idle_waiting && self.idle_flags & self.idle_subscriptions != 0 {
            self.idle_notify(sock);
            self.write_output(sock);
        }
    }

    /// Emit the idle response: one `changed:` line per subscribed pending
    /// event, in canonical order, then the terminator.
    fn idle_notify(&mut self, sock: &Stream) {
        debug_assert!(self.idle_waiting);
        debug_assert!(self.idle_flags != 0);

        let flags = std::mem::take(&mut self.idle_flags);
        self.idle_waiting = false;

        for (i, name) in idle::names().iter().enumerate() {
            if flags & (1 << i) & self.idle_subscriptions != 0 {
                self.write_args(sock, format_args!("changed: {name}\n"));
            }
        }

        self.puts(sock, "OK\n");
        self.touch();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("num", &self.num)
            .field("uid", &self.uid)
            .field("expired", &self.expired)
            .field("idle_waiting", &self.idle_waiting)
            .finish_non_exhaustive()
    }
}
