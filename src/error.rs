//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have janus `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while proxying streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// A malformed message was rejected by a protocol transformer.
    Parse(Parse),
    /// A sample expression could not be compiled or resolved.
    Expr(Expr),
    /// A peers protocol violation.
    Peers(Peers),
    /// A CLI request could not be interpreted.
    Cli(Cli),
    /// A log-format string could not be compiled.
    LogFormat,
    /// An `io::Error` from a network stream or datagram socket.
    Io,
    /// A stream exceeded its self-check call rate and was killed.
    #[allow(dead_code)]
    Livelock,
    /// The configuration root rejected a reference.
    Config,
}

#[derive(Debug)]
pub(crate) enum Parse {
    /// A pseudo-header rule was violated (order, repetition, wrong side).
    PseudoHeader,
    /// An uppercase letter or forbidden octet in a header name.
    HeaderName,
    /// A connection-specific header is not allowed in HTTP/2.
    ConnectionHeader,
    /// Multiple `content-length` values disagree or fail to parse.
    ContentLength,
    /// The `:status` pseudo-header is not three digits.
    Status,
    /// A mandatory pseudo-header is missing.
    MissingPseudo,
    /// A forbidden header or pseudo-header appeared in trailers.
    Trailer,
}

#[derive(Debug)]
pub(crate) enum Expr {
    /// The fetch keyword is not registered.
    UnknownFetch,
    /// The converter keyword is not registered.
    UnknownConverter,
    /// An argument does not match the declared mask.
    Arg,
    /// No cast exists between two stages of the pipeline.
    Cast,
    /// A deferred argument failed post-configuration resolution.
    Unresolved,
    /// The expression is not valid in the requesting pipeline phase.
    Capability,
}

#[derive(Debug)]
pub(crate) enum Peers {
    /// The hello handshake was malformed or used an unknown version.
    Handshake,
    /// A frame violated the protocol grammar.
    Protocol,
    /// A frame exceeded the negotiated size limit.
    SizeLimit,
    /// A varint was truncated.
    Truncated,
}

#[derive(Debug)]
pub(crate) enum Cli {
    /// The command line could not be tokenised.
    Syntax,
    /// The session level does not permit this command.
    #[allow(dead_code)]
    Permission,
    /// The request line exceeded the buffer without a newline.
    TooLong,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Returns true if this was caused by a malformed message.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error arose from a sample expression.
    pub fn is_expr(&self) -> bool {
        matches!(self.inner.kind, Kind::Expr(_))
    }

    /// Returns true if this was a peers protocol violation.
    pub fn is_peers(&self) -> bool {
        matches!(self.inner.kind, Kind::Peers(_))
    }

    /// Returns true if this error is from an underlying `io::Error`.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if a stream was killed by the call-rate sentinel.
    pub fn is_livelock(&self) -> bool {
        matches!(self.inner.kind, Kind::Livelock)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Cause> {
        self.inner.cause
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_expr(expr: Expr) -> Error {
        Error::new(Kind::Expr(expr))
    }

    pub(crate) fn new_peers(peers: Peers) -> Error {
        Error::new(Kind::Peers(peers))
    }

    pub(crate) fn new_cli(cli: Cli) -> Error {
        Error::new(Kind::Cli(cli))
    }

    pub(crate) fn new_log_format<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::LogFormat).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_livelock() -> Error {
        Error::new(Kind::Livelock)
    }

    pub(crate) fn new_config(msg: &'static str) -> Error {
        Error::new(Kind::Config).with(msg)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::PseudoHeader) => "invalid pseudo-header",
            Kind::Parse(Parse::HeaderName) => "invalid header name",
            Kind::Parse(Parse::ConnectionHeader) => {
                "connection-specific header not allowed"
            }
            Kind::Parse(Parse::ContentLength) => "invalid content-length",
            Kind::Parse(Parse::Status) => "invalid status pseudo-header",
            Kind::Parse(Parse::MissingPseudo) => "missing mandatory pseudo-header",
            Kind::Parse(Parse::Trailer) => "forbidden trailer header",
            Kind::Expr(Expr::UnknownFetch) => "unknown sample fetch",
            Kind::Expr(Expr::UnknownConverter) => "unknown sample converter",
            Kind::Expr(Expr::Arg) => "invalid expression argument",
            Kind::Expr(Expr::Cast) => "no cast between sample types",
            Kind::Expr(Expr::Unresolved) => "unresolved expression argument",
            Kind::Expr(Expr::Capability) => "expression not usable here",
            Kind::Peers(Peers::Handshake) => "peers handshake failed",
            Kind::Peers(Peers::Protocol) => "peers protocol violation",
            Kind::Peers(Peers::SizeLimit) => "peers message too large",
            Kind::Peers(Peers::Truncated) => "truncated peers message",
            Kind::Cli(Cli::Syntax) => "unparsable CLI request",
            Kind::Cli(Cli::Permission) => "permission denied",
            Kind::Cli(Cli::TooLong) => "CLI request line too long",
            Kind::LogFormat => "invalid log format string",
            Kind::Io => "connection error",
            Kind::Livelock => "stream call-rate self-check triggered",
            Kind::Config => "invalid configuration reference",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("janus::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}
