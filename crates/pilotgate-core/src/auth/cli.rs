//! Identity token from a CLI delegate (e.g. `gh auth token`)

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::error::{AuthError, AuthResult};

const DELEGATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `command` (program followed by arguments) and read a token from the
/// first non-empty line of its standard output.
pub async fn token_from_cli(command: &[String]) -> AuthResult<String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| AuthError::Unavailable("empty CLI delegate command".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(DELEGATE_TIMEOUT, cmd.output()).await {
        Ok(result) => result.map_err(|e| AuthError::Unavailable(format!("cannot run {}: {}", program, e)))?,
        Err(_) => return Err(AuthError::Unavailable(format!("{} timed out", program))),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AuthError::Unavailable(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AuthError::Unavailable(format!("{} printed no token", program)))
}
