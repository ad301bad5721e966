//! The management socket command interpreter.
//!
//! One CLI session is an applet attached to a stream interface. The
//! interpreter owns line framing (escapes, `;` splitting, payload mode),
//! the keyword registry with per-command access levels, and the severity
//! prefix applied to output; the commands themselves are registered by
//! the rest of the daemon and are out of scope here beyond the built-in
//! session controls (`help`, `prompt`, `quit`, `user`, `operator`,
//! `set severity-output`).

pub mod getsocks;
pub mod master;

use std::fmt;

/// Hierarchical access levels. A session may lower its own level, never
/// raise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    User,
    Oper,
    Admin,
}

/// How message severities are framed on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityOutput {
    None,
    Number,
    String,
}

/// Syslog severities used by CLI messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
}

impl Severity {
    fn name(self) -> &'static str {
        match self {
            Severity::Error => "err",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
        }
    }
}

/// Interpreter states; the session loops over `match state` until it
/// yields for I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    GetReq,
    Print,
    Callback,
    Prompt,
    End,
}

/// Session flag word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CliFlags(u32);

impl CliFlags {
    pub const NONE: CliFlags = CliFlags(0);
    /// Interactive: print a prompt after each command.
    pub const PROMPT: CliFlags = CliFlags(1 << 0);
    /// Collecting a multi-line payload.
    pub const PAYLOAD: CliFlags = CliFlags(1 << 1);
    /// Suppress the trailing newline after a message.
    pub const NOLF: CliFlags = CliFlags(1 << 2);

    #[inline]
    fn contains(self, other: CliFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn insert(&mut self, other: CliFlags) {
        self.0 |= other.0;
    }

    #[inline]
    fn remove(&mut self, other: CliFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for CliFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CliFlags({:#x})", self.0)
    }
}

/// What a command parser asks the session to do next.
#[derive(Debug)]
pub enum ParseOutcome {
    /// Print this message at this severity, then prompt.
    Print(Severity, String),
    /// Hand over to the command's I/O handler (not modelled further).
    Callback,
    /// Nothing to say.
    Done,
    /// Terminate the session.
    Quit,
}

/// A registered command.
pub struct Keyword {
    /// Leading words that must match, e.g. `["show", "info"]`.
    pub pattern: &'static [&'static str],
    pub usage: &'static str,
    pub level: Level,
    pub parse: fn(&[String], Option<&str>) -> ParseOutcome,
}

impl fmt::Debug for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keyword({})", self.pattern.join(" "))
    }
}

/// The command registry; commands register at startup.
#[derive(Debug, Default)]
pub struct Registry {
    keywords: Vec<Keyword>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            keywords: Vec::new(),
        }
    }

    pub fn register(&mut self, kw: Keyword) {
        self.keywords.push(kw);
    }

    /// Longest-prefix match over the pattern words.
    fn find(&self, words: &[String]) -> Option<&Keyword> {
        self.keywords
            .iter()
            .filter(|kw| {
                kw.pattern.len() <= words.len()
                    && kw.pattern.iter().zip(words).all(|(p, w)| w.as_str() == *p)
            })
            .max_by_key(|kw| kw.pattern.len())
    }

    fn usage_lines(&self) -> String {
        let mut out = String::from("Known commands:\n");
        for kw in &self.keywords {
            out.push_str("  ");
            out.push_str(kw.usage);
            out.push('\n');
        }
        out
    }
}

/// The payload continuation marker at end of line.
const PAYLOAD_PATTERN: &str = "<<";

/// Longest accepted request line.
const MAX_LINE: usize = 16384;

/// One CLI session.
pub struct Session<'r> {
    registry: &'r Registry,
    state: State,
    pub flags: CliFlags,
    pub level: Level,
    pub severity_output: SeverityOutput,
    /// Bytes received but not yet consumed.
    inbuf: Vec<u8>,
    /// Accumulated payload lines while in payload mode.
    payload: String,
    /// The command line awaiting its payload.
    pending_cmd: String,
    /// Message queued for the Print state.
    msg: Option<(Severity, String)>,
    out: Vec<u8>,
}

impl<'r> fmt::Debug for Session<'r> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("level", &self.level)
            .finish()
    }
}

/// Splits a raw line into `;`-separated requests, honouring backslash
/// escapes. `\\` collapses to one backslash; any other backslash simply
/// hides the next character from the splitter and is dropped.
fn split_requests(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => cur.push('\\'),
                Some(other) => cur.push(other),
                None => {}
            },
            ';' => {
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

fn split_words(req: &str) -> Vec<String> {
    req.split_whitespace().map(|w| w.to_string()).collect()
}

impl<'r> Session<'r> {
    pub fn new(registry: &'r Registry, level: Level) -> Session<'r> {
        Session {
            registry,
            state: State::Init,
            flags: CliFlags::NONE,
            level,
            severity_output: SeverityOutput::None,
            inbuf: Vec::new(),
            payload: String::new(),
            pending_cmd: String::new(),
            msg: None,
            out: Vec::new(),
        }
    }

    /// Feeds input bytes and runs the interpreter; returns true while the
    /// session stays open.
    pub fn handle_input(&mut self, data: &[u8]) -> crate::Result<bool> {
        self.inbuf.extend_from_slice(data);
        self.run()
    }

    /// Drains pending output.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    fn run(&mut self) -> crate::Result<bool> {
        loop {
            match self.state {
                State::Init => {
                    self.state = State::GetReq;
                }
                State::GetReq => {
                    let line = match self.read_line()? {
                        Some(l) => l,
                        None => return Ok(true),
                    };
                    if self.flags.contains(CliFlags::PAYLOAD) {
                        if line.is_empty() {
                            // the terminating empty line is consumed and
                            // is not part of the payload
                            self.flags.remove(CliFlags::PAYLOAD);
                            let cmd = std::mem::take(&mut self.pending_cmd);
                            let payload = std::mem::take(&mut self.payload);
                            self.dispatch(&cmd, Some(&payload));
                        } else {
                            if !self.payload.is_empty() {
                                self.payload.push('\n');
                            }
                            self.payload.push_str(&line);
                            if self.flags.contains(CliFlags::PROMPT) {
                                self.out.extend_from_slice(b"+ ");
                            }
                        }
                        continue;
                    }
                    if let Some(stripped) = line.strip_suffix(PAYLOAD_PATTERN) {
                        self.flags.insert(CliFlags::PAYLOAD);
                        self.pending_cmd = stripped.trim_end().to_string();
                        self.payload.clear();
                        if self.flags.contains(CliFlags::PROMPT) {
                            self.out.extend_from_slice(b"+ ");
                        }
                        continue;
                    }
                    for req in split_requests(&line) {
                        if self.state == State::End {
                            break;
                        }
                        self.dispatch(&req, None);
                        // a pipelined line flushes each answer in turn
                        if self.state == State::Print {
                            if let Some((sev, msg)) = self.msg.take() {
                                self.emit(sev, &msg);
                            }
                            self.state = State::Prompt;
                        }
                    }
                }
                State::Print => {
                    if let Some((sev, msg)) = self.msg.take() {
                        self.emit(sev, &msg);
                    }
                    self.state = State::Prompt;
                }
                State::Callback => {
                    // the command's io handler would run here until done
                    self.state = State::Prompt;
                }
                State::Prompt => {
                    if self.flags.contains(CliFlags::PROMPT) {
                        if self.flags.contains(CliFlags::PAYLOAD) {
                            self.out.extend_from_slice(b"+ ");
                        } else {
                            self.out.extend_from_slice(b"\n> ");
                        }
                    } else if !self.flags.contains(CliFlags::PAYLOAD) {
                        // non-interactive sessions close after one batch
                        if self.inbuf.is_empty() {
                            self.state = State::End;
                            continue;
                        }
                    }
                    self.state = State::GetReq;
                }
                State::End => {
                    return Ok(false);
                }
            }
        }
    }

    fn read_line(&mut self) -> crate::Result<Option<String>> {
        let pos = match self.inbuf.iter().position(|&b| b == b'\n') {
            Some(p) => p,
            None => {
                if self.inbuf.len() > MAX_LINE {
                    return Err(crate::Error::new_cli(crate::error::Cli::TooLong));
                }
                return Ok(None);
            }
        };
        let mut line: Vec<u8> = self.inbuf.drain(..=pos).collect();
        line.pop(); // the \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| crate::Error::new_cli(crate::error::Cli::Syntax))
    }

    fn dispatch(&mut self, req: &str, payload: Option<&str>) {
        let words = split_words(req);
        if words.is_empty() {
            self.state = State::Prompt;
            return;
        }
        // session-level built-ins come before the registry
        match words[0].as_str() {
            "quit" => {
                self.state = State::End;
                return;
            }
            "prompt" => {
                if self.flags.contains(CliFlags::PROMPT) {
                    self.flags.remove(CliFlags::PROMPT);
                } else {
                    self.flags.insert(CliFlags::PROMPT);
                }
                self.state = State::Prompt;
                return;
            }
            "help" => {
                self.msg = Some((Severity::Info, self.registry.usage_lines()));
                self.state = State::Print;
                return;
            }
            "user" => {
                self.level = self.level.min(Level::User);
                self.state = State::Prompt;
                return;
            }
            "operator" => {
                self.level = self.level.min(Level::Oper);
                self.state = State::Prompt;
                return;
            }
            "set" if words.len() >= 2 && words[1] == "severity-output" => {
                let mode = words.get(2).map(|s| s.as_str());
                match mode {
                    Some("none") => self.severity_output = SeverityOutput::None,
                    Some("number") => self.severity_output = SeverityOutput::Number,
                    Some("string") => self.severity_output = SeverityOutput::String,
                    _ => {
                        self.msg = Some((
                            Severity::Error,
                            "one of 'none', 'number', 'string' is expected.\n".into(),
                        ));
                        self.state = State::Print;
                        return;
                    }
                }
                self.state = State::Prompt;
                return;
            }
            _ => {}
        }
        match self.registry.find(&words) {
            Some(kw) => {
                if self.level < kw.level {
                    self.msg = Some((
                        Severity::Error,
                        "Permission denied\n".into(),
                    ));
                    self.state = State::Print;
                    return;
                }
                match (kw.parse)(&words, payload) {
                    ParseOutcome::Print(sev, msg) => {
                        self.msg = Some((sev, msg));
                        self.state = State::Print;
                    }
                    ParseOutcome::Callback => self.state = State::Callback,
                    ParseOutcome::Done => self.state = State::Prompt,
                    ParseOutcome::Quit => self.state = State::End,
                }
            }
            None => {
                self.msg = Some((
                    Severity::Error,
                    "Unknown command. Please enter one of the following commands only:\n"
                        .to_string()
                        + &self.registry.usage_lines(),
                ));
                self.state = State::Print;
            }
        }
    }

    fn emit(&mut self, sev: Severity, msg: &str) {
        match self.severity_output {
            SeverityOutput::None => {}
            SeverityOutput::Number => {
                self.out
                    .extend_from_slice(format!("[{}]: ", sev as u32).as_bytes());
            }
            SeverityOutput::String => {
                self.out
                    .extend_from_slice(format!("[{}]: ", sev.name()).as_bytes());
            }
        }
        self.out.extend_from_slice(msg.as_bytes());
        if !msg.ends_with('\n') && !self.flags.contains(CliFlags::NOLF) {
            self.out.push(b'\n');
        }
    }
}

/// Environment variable advertising the bound CLI listeners, kept
/// compatible with the conventional name other tooling expects.
pub const ENV_CLI: &str = "HAPROXY_CLI";
/// Same, for the master-process CLI.
pub const ENV_MASTER_CLI: &str = "HAPROXY_MASTER_CLI";

/// Renders the value of [`ENV_CLI`]: semicolon-joined listener
/// addresses, each with its family prefix.
pub fn cli_env_value(addrs: &[(&str, String)]) -> String {
    addrs
        .iter()
        .map(|(family, addr)| format!("{}@{}", family, addr))
        .collect::<Vec<_>>()
        .join(";")
}
