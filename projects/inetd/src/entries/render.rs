//! Human readable rendering of service records for logs and status dumps.
//! The output resembles a config line but is not meant to be parsed back.

use super::spec::ServiceSpec;

/// Join an argument vector with single spaces
#[must_use]
pub fn argv_to_string(args: &[String]) -> String {
    args.join(" ")
}

/// Render a spec as: name transport protocol mode user program args...
#[must_use]
pub fn render_spec(spec: &ServiceSpec) -> String {
    let user = match &spec.user.group {
        Some(group) => format!("{}:{}", spec.user.name, group),
        None => spec.user.name.clone(),
    };
    let mut line = format!(
        "{} {} {} {} {} {}",
        spec.name,
        spec.transport.name(),
        spec.protocol.name(),
        spec.concurrency.name(),
        user,
        spec.program.display(),
    );
    if !spec.args.is_empty() {
        line.push(' ');
        line.push_str(&argv_to_string(&spec.args));
    }
    line
}
