use tokio::process::Command;
use tracing::trace;

/// Error from a failed external command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

fn display(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Execute a command, returning trimmed stdout on success.
///
/// The data plane runs privileged, so commands are invoked directly.
pub(crate) async fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let cmd_display = display(program, args);
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: cmd_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Execute a command, ignoring any errors. Used on teardown paths.
pub(crate) async fn exec_ignore_errors(program: &str, args: &[&str]) {
    if let Err(e) = exec(program, args).await {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}

/// Execute a command, treating "already exists" as success.
///
/// `ip` and `iptables` report pre-existing state on stderr; idempotent setup
/// must tolerate it.
pub(crate) async fn exec_exists_ok(program: &str, args: &[&str]) -> Result<(), CommandError> {
    match exec(program, args).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e.detail) => {
            trace!(command = %e.command, "already exists, continuing");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn is_already_exists(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("file exists") || lower.contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        assert_eq!(
            display("ip", &["link", "set", "nova-br0", "up"]),
            "ip link set nova-br0 up"
        );
    }

    #[test]
    fn already_exists_detection() {
        assert!(is_already_exists("RTNETLINK answers: File exists"));
        assert!(is_already_exists("Error: ipv4: Address already exists."));
        assert!(!is_already_exists("RTNETLINK answers: Operation not permitted"));
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let out = exec("echo", &["hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn exec_error_carries_stderr() {
        let err = exec("sh", &["-c", "echo oops >&2; exit 1"]).await.unwrap_err();
        assert!(err.detail.contains("oops"));
    }

    #[tokio::test]
    async fn exec_ignore_errors_swallows_failure() {
        exec_ignore_errors("false", &[]).await;
    }

    #[tokio::test]
    async fn exec_exists_ok_tolerates_exists_stderr() {
        let result = exec_exists_ok("sh", &["-c", "echo 'RTNETLINK answers: File exists' >&2; exit 2"]).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exec_exists_ok_propagates_other_errors() {
        let result = exec_exists_ok("sh", &["-c", "echo 'permission denied' >&2; exit 2"]).await;
        assert!(result.is_err());
    }
}
