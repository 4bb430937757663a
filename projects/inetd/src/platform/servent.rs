//! Service name to port lookups in a services(5) database file.
//!
//! Lines look like `name port/protocol [aliases...] [# comment]`.

use std::path::Path;

pub const DEFAULT_SERVICES_DB: &str = "/etc/services";

/// Find the port of `name` (or one of its aliases) for `protocol` in the file content
#[must_use]
pub fn find_port(content: &str, name: &str, protocol: &str) -> Option<u16> {
    for line in content.lines() {
        let line = match line.split_once('#') {
            Some((before, _comment)) => before,
            None => line,
        };
        let mut words = line.split_whitespace();
        let Some(service) = words.next() else {
            continue;
        };
        let Some((port, proto)) = words.next().and_then(|w| w.split_once('/')) else {
            continue;
        };
        if proto != protocol {
            continue;
        }
        if service == name || words.any(|alias| alias == name) {
            if let Ok(port) = port.parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

pub fn lookup_port(db: &Path, name: &str, protocol: &str) -> std::io::Result<Option<u16>> {
    let content = std::fs::read_to_string(db)?;
    Ok(find_port(&content, name, protocol))
}
