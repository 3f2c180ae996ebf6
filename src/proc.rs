//! Player process supervision.
//!
//! The player command runs under `/bin/sh -c` so quoting, pipelines and
//! redirections compose with the usual shell conventions. A waiter task
//! publishes the exit code through a one-shot channel, and a per-controller
//! forwarder relays terminating signals to the child.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bus::Event;
use crate::error::PbmError;

/// A spawned player command and its pending exit code.
pub struct PlayerProcess {
    pid: u32,
    exit_rx: oneshot::Receiver<i32>,
    exit_code: Option<i32>,
}

impl PlayerProcess {
    pub fn spawn(cmd: &str) -> Result<PlayerProcess, PbmError> {
        debug!("spawning player: {cmd}");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                PbmError::player_cmd(format!("could not spawn player process: {err}"), 1)
            })?;

        let pid = child
            .id()
            .ok_or_else(|| PbmError::player_cmd("player process exited during spawn", 1))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                // A signal death maps onto the conventional 128 + signo.
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                Err(err) => {
                    warn!("could not wait on player process: {err}");
                    1
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(PlayerProcess {
            pid,
            exit_rx,
            exit_code: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the child to exit. The code is cached, so this is safe to
    /// race inside a `select!` and to await again afterwards.
    pub async fn wait_exit(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = (&mut self.exit_rx).await.unwrap_or(1);
        self.exit_code = Some(code);
        code
    }
}

/// Forward SIGINT/SIGTERM/SIGQUIT to the child for as long as the controller
/// runs. With no child, or when forwarding fails, exit code 130 is recorded
/// in the returned slot and a wake-up is pushed onto the event channel so the
/// controller unblocks. The slot holds -1 until then.
pub fn forward_signals(child_pid: Option<u32>, events: mpsc::Sender<Event>) -> Arc<AtomicI32> {
    let forced = Arc::new(AtomicI32::new(-1));
    let slot = forced.clone();

    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("could not install SIGINT handler: {err}");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("could not install SIGTERM handler: {err}");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("could not install SIGQUIT handler: {err}");
                return;
            }
        };

        loop {
            let sig = tokio::select! {
                _ = interrupt.recv() => Signal::SIGINT,
                _ = terminate.recv() => Signal::SIGTERM,
                _ = quit.recv() => Signal::SIGQUIT,
            };

            let forwarded = match child_pid {
                Some(pid) => match kill(Pid::from_raw(pid as i32), sig) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("could not send {sig:?} to player process: {err}");
                        false
                    }
                },
                None => false,
            };

            if !forwarded {
                slot.store(130, Ordering::SeqCst);
                let _ = events.send(Event::Wakeup).await;
            }
        }
    });

    forced
}

fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name is parenthesized and may itself contain spaces or
    // parens; fields resume after the last ')'.
    let rest = stat.rsplit_once(')')?.1;
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Whether `pid` equals `parent` or sits below it in the process tree.
pub fn is_descendant(parent: u32, pid: u32) -> bool {
    let mut current = pid;
    loop {
        if current == parent {
            return true;
        }
        if current <= 1 {
            return false;
        }
        match parent_pid(current) {
            Some(next) if next != current => current = next,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_pid_reads_proc() {
        let me = std::process::id();
        assert_eq!(parent_pid(me), Some(std::os::unix::process::parent_id()));
    }

    #[test]
    fn descendants_are_recognised() {
        let me = std::process::id();
        assert!(is_descendant(me, me));
        assert!(!is_descendant(me, 1));

        let mut child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 5")
            .spawn()
            .unwrap();
        assert!(is_descendant(me, child.id()));
        assert!(!is_descendant(child.id(), me));
        let _ = child.kill();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn exit_codes_are_published() {
        let mut ok = PlayerProcess::spawn("exit 0").unwrap();
        assert_eq!(ok.wait_exit().await, 0);
        // The code is cached for later callers.
        assert_eq!(ok.wait_exit().await, 0);

        let mut failing = PlayerProcess::spawn("exit 3").unwrap();
        assert_eq!(failing.wait_exit().await, 3);
    }

    #[tokio::test]
    async fn signal_deaths_map_past_128() {
        let mut killed = PlayerProcess::spawn("kill -9 $$").unwrap();
        assert_eq!(killed.wait_exit().await, 137);
    }
}
