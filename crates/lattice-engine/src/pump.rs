use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lattice_core::types::EngineKind;

/// Bounded ring of recent engine output lines. The oldest line is evicted
/// once `capacity` is reached; capacity 0 keeps nothing.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Background tasks copying a child's stdout/stderr into the coordinator's
/// own output and an [`OutputBuffer`].
pub struct OutputPump {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl OutputPump {
    pub fn attach<O, E>(
        engine: EngineKind,
        stdout: Option<O>,
        stderr: Option<E>,
        buffer: OutputBuffer,
        mirror: bool,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);

        if let Some(out) = stdout {
            tasks.push(tokio::spawn(pump(
                engine,
                Stream::Stdout,
                out,
                buffer.clone(),
                mirror,
                cancel.clone(),
            )));
        }
        if let Some(err) = stderr {
            tasks.push(tokio::spawn(pump(
                engine,
                Stream::Stderr,
                err,
                buffer,
                mirror,
                cancel.clone(),
            )));
        }

        Self { cancel, tasks }
    }

    /// Wait up to `grace` for the streams to reach EOF, then stop pumping.
    pub async fn drain(self, grace: Duration) {
        let cancel = self.cancel.clone();
        let tasks = self.tasks;
        let joined = tokio::time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if joined.is_err() {
            debug!("output pump did not drain in time, cancelling");
        }
        cancel.cancel();
    }

    /// Stop pumping immediately and wait for the tasks to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn pump<R>(
    engine: EngineKind,
    stream: Stream,
    reader: R,
    buffer: OutputBuffer,
    mirror: bool,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if mirror {
                        mirror_line(stream, &line).await;
                    }
                    buffer.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(engine = %engine, stream = ?stream, error = %e, "Engine output read failed");
                    break;
                }
            },
        }
    }
    debug!(engine = %engine, stream = ?stream, "Output pump stopped");
}

async fn mirror_line(stream: Stream, line: &str) {
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    let written = match stream {
        Stream::Stdout => tokio::io::stdout().write_all(&bytes).await,
        Stream::Stderr => tokio::io::stderr().write_all(&bytes).await,
    };
    if let Err(e) = written {
        debug!(error = %e, "Failed to mirror engine output");
    }
}
