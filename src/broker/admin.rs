//! Text admin protocol served on the same port as the binary protocol.
//!
//! Commands are space-separated tokens terminated by newline; list output
//! ends with a lone `.` line, matching the classic gearmand admin surface.

use super::Broker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    None,
    Shutdown,
}

pub fn handle_command(broker: &Broker, line: &str) -> (String, AdminAction) {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().unwrap_or("");

    match verb {
        "status" => (broker.admin_status(), AdminAction::None),
        "workers" => (broker.admin_workers(), AdminAction::None),
        "maxqueue" => {
            let Some(function) = tokens.next() else {
                return (
                    "ERR incomplete_args maxqueue requires a function name\n".to_string(),
                    AdminAction::None,
                );
            };
            // Absent or non-positive size clears the cap.
            let max = tokens
                .next()
                .and_then(|t| t.parse::<i64>().ok())
                .filter(|n| *n > 0)
                .map(|n| n as usize);
            broker.set_max_queue(function, max);
            ("OK\n".to_string(), AdminAction::None)
        }
        "version" => (
            format!("OK {}\n", env!("CARGO_PKG_VERSION")),
            AdminAction::None,
        ),
        "shutdown" => ("OK\n".to_string(), AdminAction::Shutdown),
        "" => (String::new(), AdminAction::None),
        other => (
            format!("ERR unknown_command {}\n", other),
            AdminAction::None,
        ),
    }
}
