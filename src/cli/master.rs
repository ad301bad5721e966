//! The master-process CLI: command routing to workers.
//!
//! The master runs an internal proxy whose clients can address a specific
//! worker by prefixing a command with `@<relative-pid>`, `@!<pid>` or
//! `@master`. The prefix is stripped before forwarding; when the bound
//! client is below the admin level, a level-lowering line is prepended so
//! the worker enforces it. Worker responses stream back verbatim until
//! the worker closes, then the relay resets and awaits the next command,
//! keep-alive style.

use super::Level;

/// Where a command should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The master process itself.
    Master,
    /// A worker by relative pid (`@1`).
    Worker(u32),
    /// A worker by absolute pid (`@!1234`).
    WorkerPid(u32),
}

/// A parsed master-CLI request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Run on the currently selected target with the prefix stripped.
    Command(Option<Target>, String),
    /// A bare prefix: switch the session's default target. The whole
    /// line, newline included, is consumed.
    SetDefault(Target),
    /// Not addressed to anyone in particular.
    Plain(String),
}

/// Splits an optional `@...` prefix off a request line.
pub fn parse_request(line: &str) -> Result<Routed, &'static str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('@') {
        return Ok(Routed::Plain(trimmed.to_string()));
    }
    let (prefix, rest) = match trimmed.find(char::is_whitespace) {
        Some(cut) => (&trimmed[..cut], trimmed[cut..].trim_start()),
        None => (trimmed, ""),
    };
    let target = if prefix == "@master" {
        Target::Master
    } else if let Some(pid) = prefix.strip_prefix("@!") {
        Target::WorkerPid(pid.parse().map_err(|_| "invalid pid")?)
    } else {
        Target::Worker(prefix[1..].parse().map_err(|_| "invalid process number")?)
    };
    if rest.is_empty() {
        Ok(Routed::SetDefault(target))
    } else {
        Ok(Routed::Command(Some(target), rest.to_string()))
    }
}

/// What the relay asks its owner to do with one request line.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayAction {
    /// Execute on the master's own interpreter.
    Local(String),
    /// Send these bytes to the given worker and stream its answer back.
    Forward(Target, Vec<u8>),
    /// Nothing to do (e.g. a default-target switch).
    None,
    /// Report an error to the client.
    Error(&'static str),
}

/// Relay states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    /// Waiting for a client command line.
    Command,
    /// A command is in flight; worker bytes stream back.
    Forwarding,
}

/// One master-CLI client session.
#[derive(Debug)]
pub struct Relay {
    pub level: Level,
    state: RelayState,
    /// Target applied when a line carries no prefix.
    pub default_target: Target,
}

impl Relay {
    pub fn new(level: Level) -> Relay {
        Relay {
            level,
            state: RelayState::Command,
            default_target: Target::Master,
        }
    }

    /// Routes one complete request line.
    pub fn route(&mut self, line: &str) -> RelayAction {
        debug_assert_eq!(self.state, RelayState::Command);
        let routed = match parse_request(line) {
            Ok(r) => r,
            Err(e) => return RelayAction::Error(e),
        };
        match routed {
            Routed::SetDefault(t) => {
                self.default_target = t;
                RelayAction::None
            }
            Routed::Plain(cmd) | Routed::Command(None, cmd) => {
                self.dispatch(self.default_target, cmd)
            }
            Routed::Command(Some(t), cmd) => self.dispatch(t, cmd),
        }
    }

    fn dispatch(&mut self, target: Target, cmd: String) -> RelayAction {
        if cmd.is_empty() {
            return RelayAction::None;
        }
        match target {
            Target::Master => RelayAction::Local(cmd),
            t => {
                self.state = RelayState::Forwarding;
                let mut payload = Vec::new();
                // a sub-admin client must not gain privileges on the
                // worker side
                match self.level {
                    Level::Admin => {}
                    Level::Oper => payload.extend_from_slice(b"operator -\n"),
                    Level::User => payload.extend_from_slice(b"user -\n"),
                }
                payload.extend_from_slice(cmd.as_bytes());
                payload.push(b'\n');
                RelayAction::Forward(t, payload)
            }
        }
    }

    /// The worker closed its side: the relay is ready for the next
    /// command.
    pub fn worker_closed(&mut self) {
        self.state = RelayState::Command;
    }

    pub fn is_forwarding(&self) -> bool {
        self.state == RelayState::Forwarding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_go_to_the_default_target() {
        let mut relay = Relay::new(Level::Admin);
        assert_eq!(
            relay.route("show info"),
            RelayAction::Local("show info".into())
        );
    }

    #[test]
    fn pid_prefix_routes_one_command() {
        let mut relay = Relay::new(Level::Admin);
        match relay.route("@1 show info") {
            RelayAction::Forward(Target::Worker(1), payload) => {
                assert_eq!(payload, b"show info\n");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(relay.is_forwarding());
        relay.worker_closed();
        assert!(!relay.is_forwarding());
        // the default target did not change
        assert_eq!(relay.default_target, Target::Master);
    }

    #[test]
    fn absolute_pid_and_master_prefixes() {
        let mut relay = Relay::new(Level::Admin);
        match relay.route("@!4242 show info") {
            RelayAction::Forward(Target::WorkerPid(4242), _) => {}
            other => panic!("unexpected {:?}", other),
        }
        relay.worker_closed();
        assert_eq!(
            relay.route("@master show info"),
            RelayAction::Local("show info".into())
        );
    }

    #[test]
    fn bare_prefix_switches_default_and_eats_the_line() {
        let mut relay = Relay::new(Level::Admin);
        assert_eq!(relay.route("@2"), RelayAction::None);
        assert_eq!(relay.default_target, Target::Worker(2));
        match relay.route("show info") {
            RelayAction::Forward(Target::Worker(2), _) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn sub_admin_levels_are_prepended() {
        let mut relay = Relay::new(Level::User);
        match relay.route("@1 show info") {
            RelayAction::Forward(_, payload) => {
                assert_eq!(payload, b"user -\nshow info\n");
            }
            other => panic!("unexpected {:?}", other),
        }
        relay.worker_closed();
        relay.level = Level::Oper;
        match relay.route("@1 show info") {
            RelayAction::Forward(_, payload) => {
                assert_eq!(payload, b"operator -\nshow info\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_pids_are_reported() {
        let mut relay = Relay::new(Level::Admin);
        assert_eq!(
            relay.route("@zzz show info"),
            RelayAction::Error("invalid process number")
        );
        assert_eq!(
            relay.route("@!abc show info"),
            RelayAction::Error("invalid pid")
        );
    }
}
