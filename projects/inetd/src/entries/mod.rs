//! Service entries as read from inetd.conf: the data model, the parser and
//! the textual rendering used in diagnostics.

pub mod parsing;
pub mod render;
pub mod spec;

pub use parsing::{
    parse_config, parse_file, parse_line, ParseError, ParseErrorKind, ParsedConfig, Resolver,
    SystemResolver,
};
pub use render::{argv_to_string, render_spec};
pub use spec::{Concurrency, Protocol, RunAs, ServiceKey, ServiceSpec, SpecError, Transport};
