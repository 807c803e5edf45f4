//! Connects a VM console to stdio.

use burrow::{Console, Manager};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

/// How long a guest gets to power off after Ctrl-C before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

fn pump_stdin(console: Console) -> (JoinHandle<()>, JoinHandle<()>) {
    let Console {
        input: mut writer,
        output: mut reader,
    } = console;

    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let stdout_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
            }
        }
    });

    (stdin_task, stdout_task)
}

/// Streams the console until the VM exits. Ctrl-C asks the guest to stop
/// and kills it if it is still running after [`STOP_GRACE`].
pub async fn attach(manager: &Manager) -> anyhow::Result<()> {
    let console = manager.console().await?;
    let (stdin_task, stdout_task) = pump_stdin(console);

    let result = tokio::select! {
        result = manager.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\r\nStopping VM...\r");
            if let Err(e) = manager.stop().await {
                tracing::warn!("Stop request failed: {}", e);
            }
            match tokio::time::timeout(STOP_GRACE, manager.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    eprintln!("VM did not stop within {}s, killing it\r", STOP_GRACE.as_secs());
                    manager.kill().await?;
                    manager.wait().await
                }
            }
        }
    };

    manager.close_console();
    stdin_task.abort();
    let _ = stdout_task.await;
    result.map_err(Into::into)
}
