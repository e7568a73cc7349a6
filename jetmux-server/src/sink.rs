//! JSON-lines sink writing matched messages to stdout.

use async_trait::async_trait;
use jetmux_core::registry::{JobSink, SinkError};
use jetmux_sdk::{JobId, MatchedMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Output shared by the sinks of all standing jobs, so that lines from
/// different jobs never interleave.
#[derive(Clone)]
pub struct JsonLinesOutput {
    writer: SharedWriter,
}

impl JsonLinesOutput {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn sink_for(&self, job_id: JobId) -> Arc<dyn JobSink> {
        Arc::new(JsonLinesSink {
            job_id,
            writer: Arc::clone(&self.writer),
            written: AtomicU64::new(0),
        })
    }
}

struct JsonLinesSink {
    job_id: JobId,
    writer: SharedWriter,
    written: AtomicU64,
}

#[async_trait]
impl JobSink for JsonLinesSink {
    async fn on_data(&self, message: MatchedMessage) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn on_complete(&self, matched_count: u64) {
        tracing::info!(
            job_id = %self.job_id,
            matched_count,
            lines_written = self.written.load(Ordering::Relaxed),
            "Standing job finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetmux_sdk::Source;
    use time::OffsetDateTime;

    fn message(job_id: &str) -> MatchedMessage {
        MatchedMessage {
            job_id: JobId::from(job_id),
            correlation_id: "corr".to_string(),
            text_content: "bitcoin".to_string(),
            source: Source::Bluesky,
            source_url: "https://bsky.app/profile/alice.test/post/3k".to_string(),
            author_name: "alice.test".to_string(),
            upvotes: None,
            comment_count: None,
            published_at: OffsetDateTime::UNIX_EPOCH,
            collected_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_writes_one_json_object_per_line() {
        let (client, mut server) = tokio::io::duplex(4096);
        let output = JsonLinesOutput::new(client);
        let sink = output.sink_for(JobId::from("btc"));

        sink.on_data(message("btc")).await.unwrap();
        sink.on_data(message("btc")).await.unwrap();
        drop(sink);
        drop(output);

        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut buf)
            .await
            .unwrap();
        let lines: Vec<_> = buf.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["jobId"], "btc");
        assert_eq!(value["source"], "bluesky");
    }
}
