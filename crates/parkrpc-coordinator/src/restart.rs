use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::member::Member;

/// Line a restarted node prints once it is serving; the restart is judged
/// successful when it appears on the script's stdout.
pub const STARTUP_SUCCESS_LINE: &str = "Server running.";

/// Runs the configured restart command for a failed node and waits (bounded)
/// for the startup success line.
///
/// The command is a shell template; `{identity}` and `{addr}` are replaced
/// with the failed member's values. Returns `true` when the success line was
/// seen within `wait`.
pub async fn run_restart(cmd_template: &str, member: &Member, wait: Duration) -> bool {
    let cmd = cmd_template
        .replace("{identity}", &member.identity)
        .replace("{addr}", &member.addr);

    info!(identity = %member.identity, %cmd, "restarting failed node");

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(identity = %member.identity, error = %e, "could not launch restart command");
            return false;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        warn!(identity = %member.identity, "restart command has no stdout");
        return false;
    };

    let watch = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == STARTUP_SUCCESS_LINE {
                return true;
            }
        }
        false
    };

    let succeeded = tokio::time::timeout(wait, watch).await.unwrap_or(false);

    // The restarted server backgrounds itself; the script process is done
    // either way.
    let _ = child.start_kill();

    if succeeded {
        info!(identity = %member.identity, "node restarted successfully");
    } else {
        warn!(identity = %member.identity, "node restart did not report success");
    }
    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> Member {
        Member::new("node-a", "127.0.0.1:9001")
    }

    #[tokio::test]
    async fn test_restart_success_line_detected() {
        let ok = run_restart(
            "echo 'Server running.'",
            &member(),
            Duration::from_secs(5),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_restart_without_success_line_fails() {
        let ok = run_restart("echo starting up", &member(), Duration::from_secs(5)).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_restart_times_out() {
        let ok = run_restart("sleep 30", &member(), Duration::from_millis(200)).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_template_substitution() {
        let ok = run_restart(
            "test {identity} = node-a && echo 'Server running.'",
            &member(),
            Duration::from_secs(5),
        )
        .await;
        assert!(ok);
    }
}
