//! Periodic status-file writer.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use wstun_task::{ShutdownSignal, Task};

use crate::ClientInner;

const WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Appends a one-line connection summary to the status file every second.
pub(crate) struct StatusWriterTask {
    pub(crate) path: Utf8PathBuf,
    pub(crate) client: Arc<ClientInner>,
}

#[async_trait]
impl Task for StatusWriterTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "status writer";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut file = std::fs::File::create(self.path.as_std_path())?;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(WRITE_INTERVAL) => {}
                _ = shutdown_signal.wait() => return Ok(()),
            }

            let stats = self.client.manager.stats();
            let line = format!(
                "Connected: {}, Total Connections: {}, Failed Connections: {}, Last Error: {}\n",
                self.client.manager.is_connected(),
                stats.total_connections,
                stats.failed_connections,
                stats.last_error.as_deref().unwrap_or("<nil>"),
            );
            if let Err(error) = file.write_all(line.as_bytes()) {
                error!(%error, "failed to write to status file");
            }
        }
    }
}
