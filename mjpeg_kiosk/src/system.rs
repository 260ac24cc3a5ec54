// THEORY:
// The kiosk touches the host system in exactly two ways: it plays a sound when
// the camera reports motion, and it tells the X server never to blank the
// screen. Both are external commands run through `tokio::process`, so neither
// blocks the runtime.

use crate::error::SystemError;
use std::ffi::OsStr;
use std::future::Future;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Something to do when a motion notification arrives.
pub trait Alert: Send + Sync + 'static {
    fn play(&self) -> impl Future<Output = Result<(), SystemError>> + Send;
}

/// Runs a program (by default `aplay` with a sound file) per notification.
#[derive(Debug, Clone)]
pub struct CommandAlert {
    argv: Vec<String>,
}

impl CommandAlert {
    /// `argv[0]` is the program. An empty `argv` makes the alert a no-op.
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Alert for CommandAlert {
    async fn play(&self) -> Result<(), SystemError> {
        let Some((program, args)) = self.argv.split_first() else {
            debug!("No alert command configured");
            return Ok(());
        };
        run(program, args).await
    }
}

/// Disables the X11 screen saver and display power management on `display`.
pub async fn disable_screen_blanking(display: &str) -> Result<(), SystemError> {
    for setting in XSET_SETTINGS {
        let args: Vec<&str> = ["-display", display].iter().chain(setting).copied().collect();
        run("xset", &args).await?;
    }
    let x_display = display;
    info!(x_display, "Screen blanking disabled");
    Ok(())
}

const XSET_SETTINGS: [&[&str]; 3] = [&["s", "off"], &["-dpms"], &["s", "noblank"]];

async fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<(), SystemError> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| SystemError::Spawn {
            program: program.to_string(),
            source,
        })?;
    check(program, status)
}

fn check(program: &str, status: std::process::ExitStatus) -> Result<(), SystemError> {
    if status.success() {
        Ok(())
    } else {
        Err(SystemError::Failed {
            program: program.to_string(),
            status,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_command_is_a_no_op() {
        CommandAlert::new(Vec::new()).play().await.unwrap();
    }

    #[tokio::test]
    async fn successful_command() {
        CommandAlert::new(vec!["true".into()]).play().await.unwrap();
    }

    #[tokio::test]
    async fn failing_command_reports_status() {
        let err = CommandAlert::new(vec!["false".into()]).play().await.unwrap_err();
        assert!(matches!(err, SystemError::Failed { ref program, .. } if program == "false"));
    }

    #[tokio::test]
    async fn missing_program_reports_spawn_error() {
        let err = CommandAlert::new(vec!["/nonexistent/kiosk-alert".into()])
            .play()
            .await
            .unwrap_err();
        assert!(matches!(err, SystemError::Spawn { .. }));
    }

    #[tokio::test]
    async fn blanking_on_an_unreachable_display_fails() {
        // Either xset is missing or it cannot open the display.
        let err = disable_screen_blanking(":987").await.unwrap_err();
        assert!(err.to_string().contains("xset"), "{err}");
    }
}
