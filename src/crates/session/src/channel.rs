//! Request/response protocol over the engine's pseudo-terminal.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use regex_lite::Regex;
use tracing::{debug, warn};

use crate::config::ProtocolPatterns;
use crate::error::{SessionError, SessionResult};
use crate::sexpr;

/// Why waiting for a pattern stopped without a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectError {
    Timeout(Duration),
    /// The pty closed, usually because the engine exited.
    Eof,
}

/// Accumulates pty output and waits for patterns in it.
pub struct Expect {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: String,
    // Trailing bytes of a UTF-8 sequence split across reads.
    partial: Vec<u8>,
}

impl Expect {
    /// Start a reader thread forwarding everything `reader` produces.
    pub fn spawn<R: Read + Send + 'static>(reader: R) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("engine-pty-reader".to_string())
            .spawn(move || forward_output(reader, tx))?;
        Ok(Self::from_receiver(rx))
    }

    pub fn from_receiver(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buffer: String::new(),
            partial: Vec::new(),
        }
    }

    /// Wait for `pattern`, returning the text before it and consuming through the match.
    pub fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String, ExpectError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = pattern.find(&self.buffer) {
                let before = self.buffer[..found.start()].to_string();
                self.buffer.drain(..found.end());
                return Ok(before);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExpectError::Timeout(timeout));
            }
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.push_bytes(&chunk),
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(ExpectError::Timeout(timeout)),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ExpectError::Eof),
            }
        }
    }

    /// Output received but not consumed by a match yet.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Decode `chunk` into the buffer, holding back an incomplete trailing sequence.
    fn push_bytes(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.partial) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.partial.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.partial[..valid]));
                    match err.error_len() {
                        None => {
                            self.partial.drain(..valid);
                            return;
                        }
                        Some(invalid) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.partial.drain(..valid + invalid);
                        }
                    }
                }
            }
        }
    }
}

fn forward_output<R: Read>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => break,
        }
    }
}

/// Protocol state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Prompt showing, ready for a command.
    Idle,
    /// Command written, waiting for the prompt.
    Sent,
    /// Reply classified; returns to `Idle` before the call completes.
    Resolved,
    /// Transport failed; no further commands are accepted.
    Broken,
}

/// How the engine answered a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Success marker on the last reply line.
    Accepted,
    /// Failure marker on the last reply line.
    Rejected,
    /// Some other value, e.g. the result of a getter.
    Returned,
}

/// Outcome of one command exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub verdict: Verdict,
    /// Reply text without the command echo or the prompt.
    pub reply: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.verdict != Verdict::Rejected
    }

    /// True only when the reply ended with the success marker.
    pub fn accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }

    /// Last non-empty reply line, where the engine prints a getter's value.
    pub fn value_line(&self) -> &str {
        self.reply
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or("")
    }

    /// Parse the reply with the s-expression grammar.
    pub fn parse(&self) -> SessionResult<Vec<sexpr::Expr>> {
        sexpr::parse(&self.reply)
            .map_err(|err| SessionError::unexpected(format!("{err} in reply {:?}", self.reply)))
    }
}

/// Sends one command at a time and classifies the reply.
pub struct CommandChannel {
    writer: Box<dyn Write + Send>,
    output: Expect,
    patterns: ProtocolPatterns,
    timeout: Duration,
    state: ChannelState,
}

impl CommandChannel {
    /// Wrap a channel whose engine is already showing its prompt.
    pub fn new(
        writer: Box<dyn Write + Send>,
        output: Expect,
        patterns: ProtocolPatterns,
        timeout: Duration,
    ) -> Self {
        Self {
            writer,
            output,
            patterns,
            timeout,
            state: ChannelState::Idle,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Execute `command` and classify the engine's answer.
    ///
    /// Unbalanced commands fail with [`SessionError::Syntax`] without being sent.
    /// Failures of the exchange itself break the channel and return
    /// [`SessionError::Transport`]. A rejected command is not an error: it
    /// yields [`Verdict::Rejected`] and a warning.
    pub fn execute(&mut self, command: &str) -> SessionResult<CommandResult> {
        if !sexpr::is_balanced(command) {
            return Err(SessionError::Syntax(command.to_string()));
        }
        match self.state {
            ChannelState::Idle => {}
            ChannelState::Broken => {
                return Err(SessionError::transport(command, "channel is broken"));
            }
            ChannelState::Sent | ChannelState::Resolved => {
                return Err(SessionError::transport(command, "another command is in flight"));
            }
        }

        debug!(command, "sending engine command");
        if let Err(err) = self.send_line(command) {
            self.state = ChannelState::Broken;
            return Err(SessionError::transport(command, err.to_string()));
        }
        self.state = ChannelState::Sent;

        let before = match self.output.expect(&self.patterns.prompt, self.timeout) {
            Ok(before) => before,
            Err(err) => {
                self.state = ChannelState::Broken;
                let reason = match err {
                    ExpectError::Timeout(timeout) => format!("no prompt within {timeout:?}"),
                    ExpectError::Eof => "engine closed the terminal".to_string(),
                };
                return Err(SessionError::transport(command, reason));
            }
        };

        let result = classify(&self.patterns, command, &before);
        self.state = ChannelState::Resolved;
        if result.verdict == Verdict::Rejected {
            warn!(command, reply = %result.reply, "engine rejected command");
        } else {
            debug!(command, reply = %result.reply, "engine accepted command");
        }
        self.state = ChannelState::Idle;
        Ok(result)
    }

    /// Write one line without waiting for a prompt, as needed for quit.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Strip the echoed command and classify the last reply line.
pub fn classify(patterns: &ProtocolPatterns, command: &str, before: &str) -> CommandResult {
    let normalized = before.replace("\r\n", "\n").replace('\r', "");
    let mut lines: Vec<&str> = normalized.lines().collect();
    if lines
        .first()
        .is_some_and(|first| first.trim() == command.trim())
    {
        lines.remove(0);
    }
    let reply = lines.join("\n").trim().to_string();

    let last = reply.lines().last().unwrap_or("").trim();
    let verdict = if patterns.failure.is_match(last) {
        Verdict::Rejected
    } else if patterns.success.is_match(last) {
        Verdict::Accepted
    } else {
        Verdict::Returned
    };
    CommandResult { verdict, reply }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn channel(replies: &[&str]) -> (CommandChannel, Sink, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        for reply in replies {
            tx.send(reply.as_bytes().to_vec()).unwrap();
        }
        let sink = Sink::default();
        let channel = CommandChannel::new(
            Box::new(sink.clone()),
            Expect::from_receiver(rx),
            ProtocolPatterns::default(),
            Duration::from_millis(200),
        );
        (channel, sink, tx)
    }

    #[test]
    fn accepted_command_returns_to_idle() {
        let (mut channel, sink, _tx) =
            channel(&["(sclRun \"all\")\r\nt\r\n> "]);
        let result = channel.execute(r#"(sclRun "all")"#).unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert!(result.success());
        assert!(result.accepted());
        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"(sclRun \"all\")\n");
    }

    #[test]
    fn rejected_command_is_not_an_error() {
        let (mut channel, _sink, _tx) = channel(&["(sclQuitt)\r\nnil\r\n> "]);
        let result = channel.execute("(sclQuitt)").unwrap();
        assert_eq!(result.verdict, Verdict::Rejected);
        assert!(!result.success());
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn value_replies_are_returned_without_echo() {
        let (mut channel, _sink, _tx) = channel(&["(get)\r\n1.5e-6\r\n> "]);
        let result = channel.execute("(get)").unwrap();
        assert_eq!(result.verdict, Verdict::Returned);
        assert_eq!(result.reply, "1.5e-6");
    }

    #[test]
    fn unbalanced_commands_never_reach_the_engine() {
        let (mut channel, sink, _tx) = channel(&[]);
        for cmd in ["(sclRun \"all\"", "sclRun)", ")("] {
            let err = channel.execute(cmd).unwrap_err();
            assert!(matches!(err, SessionError::Syntax(_)));
        }
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn missing_prompt_breaks_the_channel() {
        let (mut channel, _sink, _tx) = channel(&["(slow)\r\n"]);
        let err = channel.execute("(slow)").unwrap_err();
        assert!(err.is_transport());
        assert_eq!(channel.state(), ChannelState::Broken);

        let err = channel.execute("(next)").unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn closed_terminal_is_a_transport_failure() {
        let (mut channel, _sink, tx) = channel(&["(crash)\r\n"]);
        drop(tx);
        let err = channel.execute("(crash)").unwrap_err();
        match err {
            SessionError::Transport { reason, .. } => assert!(reason.contains("closed")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn expect_consumes_through_the_match_only() {
        let (tx, rx) = mpsc::channel();
        tx.send(b"banner\r\n> rest".to_vec()).unwrap();
        let mut output = Expect::from_receiver(rx);
        let prompt = ProtocolPatterns::default().prompt;
        let before = output.expect(&prompt, Duration::from_millis(50)).unwrap();
        assert_eq!(before, "banner");
        assert_eq!(output.pending(), "rest");
    }

    #[test]
    fn diagnostics_without_a_marker_are_not_accepted() {
        let (mut channel, _sink, _tx) = channel(&[
            "(sclSetAttribute p \"bogus\" 1)\r\nERROR (SCL-12): no such attribute \"bogus\"\r\n> ",
        ]);
        let result = channel.execute(r#"(sclSetAttribute p "bogus" 1)"#).unwrap();
        assert_eq!(result.verdict, Verdict::Returned);
        assert!(!result.accepted());
    }

    #[test]
    fn value_line_skips_leading_diagnostics() {
        let (mut channel, _sink, _tx) = channel(&[
            "(get)\r\nWARNING: expected `)` near \"W\r\n1.5e-6\r\n\r\n> ",
        ]);
        let result = channel.execute("(get)").unwrap();
        assert_eq!(result.verdict, Verdict::Returned);
        assert_eq!(result.value_line(), "1.5e-6");
        assert!(result.parse().is_err());
    }

    #[test]
    fn multibyte_characters_survive_split_reads() {
        let (tx, rx) = mpsc::channel();
        let text = "r\u{e9}sum\u{e9}\r\n> ".as_bytes();
        tx.send(text[..2].to_vec()).unwrap();
        tx.send(text[2..].to_vec()).unwrap();
        let mut output = Expect::from_receiver(rx);
        let prompt = ProtocolPatterns::default().prompt;
        let before = output.expect(&prompt, Duration::from_millis(50)).unwrap();
        assert_eq!(before, "r\u{e9}sum\u{e9}");
    }

    #[test]
    fn invalid_bytes_are_replaced_without_stalling() {
        let (tx, rx) = mpsc::channel();
        tx.send(b"a\xffb\r\n> ".to_vec()).unwrap();
        let mut output = Expect::from_receiver(rx);
        let prompt = ProtocolPatterns::default().prompt;
        let before = output.expect(&prompt, Duration::from_millis(50)).unwrap();
        assert_eq!(before, "a\u{fffd}b");
    }
}
