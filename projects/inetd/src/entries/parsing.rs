//! Parse inetd.conf into resolved `ServiceSpec`s.
//!
//! Each non-comment line has the fields
//! `service transport protocol wait|nowait user[:group] program arg0 [args...]`
//! separated by whitespace. Lines that fail to parse are collected as
//! `ParseError`s next to the successfully parsed specs so the caller can
//! report them without giving up on the rest of the file.

use log::trace;

use super::spec::{Concurrency, Protocol, RunAs, ServiceKey, ServiceSpec, SpecError, Transport};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Field separators of the config format
pub const DELIMS: &[char] = &[' ', '\x0c', '\n', '\r', '\t', '\x0b'];

/// Looks up the names used in the config against system databases
pub trait Resolver {
    fn port(&self, service: &str, protocol: Protocol) -> Result<u16, String>;
    fn user(&self, user: &str, group: Option<&str>) -> Result<RunAs, String>;
}

/// Resolver backed by the services database file and the passwd/group databases
#[derive(Clone, Debug)]
pub struct SystemResolver {
    pub services_db: PathBuf,
}

impl SystemResolver {
    #[must_use]
    pub fn new(services_db: PathBuf) -> Self {
        Self { services_db }
    }
}

impl Resolver for SystemResolver {
    fn port(&self, service: &str, protocol: Protocol) -> Result<u16, String> {
        if let Ok(port) = service.parse::<u16>() {
            return Ok(port);
        }
        match crate::platform::servent::lookup_port(&self.services_db, service, protocol.db_name())
        {
            Ok(Some(port)) => Ok(port),
            Ok(None) => Err(format!(
                "no entry for {}/{} in {:?}",
                service,
                protocol.db_name(),
                self.services_db
            )),
            Err(e) => Err(format!("could not read {:?}: {e}", self.services_db)),
        }
    }

    fn user(&self, user: &str, group: Option<&str>) -> Result<RunAs, String> {
        crate::platform::pwnam::resolve_run_as(user, group)
    }
}

#[derive(Debug)]
pub enum ParseErrorKind {
    MissingField(&'static str),
    UnknownTransport(String),
    UnknownProtocol(String),
    UnknownWait(String),
    BadAddress(String),
    UnknownService(String),
    UnknownUser(String),
    Invalid(SpecError),
    Duplicate(ServiceKey),
}

#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            ParseErrorKind::MissingField(field) => write!(f, "missing field {field}"),
            ParseErrorKind::UnknownTransport(word) => {
                write!(f, "unknown transport {word:?}, expected stream or dgram")
            }
            ParseErrorKind::UnknownProtocol(word) => write!(f, "unknown protocol {word:?}"),
            ParseErrorKind::UnknownWait(word) => {
                write!(f, "expected wait or nowait, found {word:?}")
            }
            ParseErrorKind::BadAddress(word) => write!(f, "can not use {word:?} as bind address"),
            ParseErrorKind::UnknownService(reason) => write!(f, "unknown service: {reason}"),
            ParseErrorKind::UnknownUser(reason) => write!(f, "unknown user: {reason}"),
            ParseErrorKind::Invalid(e) => write!(f, "invalid entry: {e}"),
            ParseErrorKind::Duplicate(key) => {
                write!(f, "service {key} was already defined, ignoring this line")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing a whole file. Errors are diagnostics only.
#[derive(Debug, Default)]
pub struct ParsedConfig {
    pub specs: Vec<ServiceSpec>,
    pub errors: Vec<ParseError>,
}

pub fn parse_file(path: &Path, resolver: &dyn Resolver) -> std::io::Result<ParsedConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_config(&content, resolver))
}

#[must_use]
pub fn parse_config(content: &str, resolver: &dyn Resolver) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();
    let mut seen = HashSet::new();

    for (idx, line) in content.lines().enumerate() {
        let line_nr = idx + 1;
        match parse_line(line, resolver) {
            Ok(Some(spec)) => {
                if seen.insert(spec.key()) {
                    trace!("Parsed line {line_nr}: {spec}");
                    parsed.specs.push(spec);
                } else {
                    parsed.errors.push(ParseError {
                        line: line_nr,
                        kind: ParseErrorKind::Duplicate(spec.key()),
                    });
                }
            }
            Ok(None) => {}
            Err(kind) => parsed.errors.push(ParseError {
                line: line_nr,
                kind,
            }),
        }
    }
    parsed
}

/// Parse one line. Blank lines and comments yield `Ok(None)`.
pub fn parse_line(
    line: &str,
    resolver: &dyn Resolver,
) -> Result<Option<ServiceSpec>, ParseErrorKind> {
    let line = line.trim_matches(DELIMS);
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut fields = line.split(DELIMS).filter(|field| !field.is_empty());
    let mut next_field =
        |name: &'static str| fields.next().ok_or(ParseErrorKind::MissingField(name));

    let service = next_field("service")?;
    let transport_word = next_field("transport")?;
    let protocol_word = next_field("protocol")?;
    let wait_word = next_field("wait")?;
    let user_word = next_field("user")?;
    let program = next_field("program")?;

    let transport = Transport::from_conf(transport_word)
        .ok_or_else(|| ParseErrorKind::UnknownTransport(transport_word.to_owned()))?;
    let protocol = Protocol::from_conf(protocol_word)
        .ok_or_else(|| ParseErrorKind::UnknownProtocol(protocol_word.to_owned()))?;
    let concurrency = Concurrency::from_conf(wait_word)
        .ok_or_else(|| ParseErrorKind::UnknownWait(wait_word.to_owned()))?;

    let (host, service_name) = split_host(service)?;
    let addr = match host {
        Some(host) => host,
        None => protocol.wildcard(),
    };
    let port = resolver
        .port(service_name, protocol)
        .map_err(ParseErrorKind::UnknownService)?;

    let (user_name, group_name) = split_user(user_word);
    let user = resolver
        .user(user_name, group_name)
        .map_err(ParseErrorKind::UnknownUser)?;

    let args = fields.map(str::to_owned).collect::<Vec<_>>();

    let spec = ServiceSpec {
        name: service.to_owned(),
        transport,
        protocol,
        concurrency,
        user,
        program: PathBuf::from(program),
        args,
        listen: SocketAddr::new(addr, port),
    };
    spec.validate().map_err(ParseErrorKind::Invalid)?;
    Ok(Some(spec))
}

/// Split an optional `host:` prefix off the service field.
/// `*` as host means the wildcard address, IPv6 hosts need brackets.
fn split_host(service: &str) -> Result<(Option<IpAddr>, &str), ParseErrorKind> {
    let Some((host, name)) = service.rsplit_once(':') else {
        return Ok((None, service));
    };
    if name.is_empty() {
        return Err(ParseErrorKind::BadAddress(service.to_owned()));
    }
    if host == "*" {
        return Ok((None, name));
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse::<IpAddr>()
        .map(|addr| (Some(addr), name))
        .map_err(|_| ParseErrorKind::BadAddress(host.to_owned()))
}

/// `user`, `user:group` or the historic `user.group`
fn split_user(word: &str) -> (&str, Option<&str>) {
    if let Some((user, group)) = word.split_once(':') {
        (user, Some(group))
    } else if let Some((user, group)) = word.split_once('.') {
        (user, Some(group))
    } else {
        (word, None)
    }
}
