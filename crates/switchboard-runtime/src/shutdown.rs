//! Graceful-then-forced child termination: send SIGTERM (or run a
//! configured stop command), wait up to a caller-supplied grace period,
//! and escalate to SIGKILL if the child hasn't exited by then.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Send the platform's graceful termination signal (SIGTERM on Unix,
/// immediate kill on Windows — there is no SIGTERM equivalent), wait up
/// to `grace` for the child to exit, then escalate to SIGKILL.
pub async fn stop_gracefully(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            // Already reaped by someone else; wait() returns immediately.
            return child.wait().await;
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            if e == nix::errno::Errno::ESRCH {
                return child.wait().await;
            }
            warn!(pid, error = %e, "failed to send SIGTERM");
        }
        match timeout(grace, child.wait()).await {
            Ok(result) => return result,
            Err(_) => debug!(pid, "graceful stop timed out, escalating to SIGKILL"),
        }
        child.kill().await?;
        child.wait().await
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        child.kill().await?;
        child.wait().await
    }
}

/// Run a configured stop command (with `${PID}` already expanded) and
/// wait up to `grace` for the child to exit on its own; escalate to
/// SIGKILL on timeout or if the stop command itself fails to run.
pub async fn stop_with_command(
    child: &mut Child,
    argv: &[String],
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    let Some((program, args)) = argv.split_first() else {
        return stop_gracefully(child, grace).await;
    };

    let spawn_result = Command::new(program).args(args).spawn();
    match spawn_result {
        Ok(mut stopper) => {
            let _ = stopper.wait().await;
        }
        Err(e) => {
            warn!(error = %e, "stop command failed to spawn, falling back to signal");
            return stop_gracefully(child, grace).await;
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            debug!("stop command did not cause exit within grace period, sending SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}
