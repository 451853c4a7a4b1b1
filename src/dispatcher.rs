//! Command dispatcher: the request/response contract.
//!
//! `execute(session, command).await` sends exactly one command and returns
//! exactly one result. The dispatcher holds the session channel for the whole
//! exchange, so commands on one session complete in submission order and
//! never interleave on the wire.
//!
//! Retry policy is conservative: by default a reply timeout is final. When a
//! retry count is configured (per session, or per command by a device
//! profile) the frame is re-sent and the reply awaited again, up to
//! `1 + retry_count` attempts in total.

use std::time::Duration;

use tracing::{debug, warn};

use crate::command::{Command, Reply};
use crate::config::SessionConfig;
use crate::error::{CommandError, CommandResult, TransportError};
use crate::session::Session;
use crate::transport::Transport;

/// Serialized command execution with timeout/retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatcher {
    retry_count: u32,
    busy_wait: Option<Duration>,
}

impl Dispatcher {
    /// No retries, fail fast when the session is busy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the retry count from the session config.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            busy_wait: None,
        }
    }

    /// Re-sends after a read timeout, for commands without an override.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Wait up to `wait` for an in-flight command instead of failing with
    /// `SessionBusy` straight away.
    pub fn with_busy_wait(mut self, wait: Duration) -> Self {
        self.busy_wait = Some(wait);
        self
    }

    /// Default re-send count.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// How long to wait for a busy session, if at all.
    pub fn busy_wait(&self) -> Option<Duration> {
        self.busy_wait
    }

    /// Total attempts for `command`; a per-command override wins.
    pub fn attempts_for(&self, command: &Command) -> u32 {
        1 + command.retry_override().unwrap_or(self.retry_count)
    }

    /// Execute one command on `session`.
    ///
    /// Transport failures fault the session. Device rejections and replies
    /// that fail to decode leave it ready for the next command.
    pub async fn execute(&self, session: &Session, command: &Command) -> CommandResult {
        let mut channel = session.acquire_channel(self.busy_wait).await?;
        let prior = session.begin()?;
        let command_id = session.next_command_id();
        debug!(session = session.id(), command_id, command = %command, "Executing command");

        let result = match channel.transport() {
            Ok(transport) => {
                self.exchange(session, transport, command, self.attempts_for(command))
                    .await
            }
            Err(e) => Err(CommandError::Transport(e)),
        };

        match &result {
            Ok(reply) => {
                session.finish(prior, Some(command_id));
                debug!(session = session.id(), command_id, ?reply, "Command completed");
            }
            Err(CommandError::Transport(error)) => {
                session.fault(error);
            }
            Err(error) => {
                session.finish(prior, None);
                debug!(session = session.id(), command_id, %error, "Command failed without faulting");
            }
        }
        result
    }

    /// One write/read/decode cycle on an already acquired transport. Leaves
    /// session state alone.
    pub(crate) async fn exchange(
        &self,
        session: &Session,
        transport: &mut dyn Transport,
        command: &Command,
        attempts: u32,
    ) -> CommandResult {
        let codec = session.codec();
        let frame = codec.encode(command)?;
        let until = codec.read_until_for(command);
        let timeout = command
            .timeout_override()
            .unwrap_or_else(|| session.default_timeout());
        let attempts = attempts.max(1);

        let mut attempt = 1;
        let raw = loop {
            session.guarded(transport.write(&frame)).await?;
            if !command.expects_reply() {
                return Ok(Reply::Ack);
            }
            match session.guarded(transport.read_until(until, timeout)).await {
                Ok(raw) => break raw,
                Err(TransportError::Timeout(after)) if attempt < attempts => {
                    warn!(
                        session = session.id(),
                        command = command.name(),
                        attempt,
                        attempts,
                        timeout = ?after,
                        "Reply timed out, re-sending"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(codec.decode(&raw, command.reply_shape())?)
    }
}
