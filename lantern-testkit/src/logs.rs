use std::io::Write;
use std::sync::Arc;

use lantern::logging::JsonLogLayer;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

/// In-memory sink for the JSON log layer.
///
/// Install it for the current thread with [`CapturedLogs::set_default`];
/// `#[tokio::test]` runs on one thread, so every task spawned by the test
/// logs into it.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

pub struct CapturedWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for CapturedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl CapturedLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route this thread's events through a JSON layer writing here.
    pub fn set_default(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(JsonLogLayer::new(self.clone()));
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Every captured line parsed as JSON. Panics on a malformed line.
    pub fn records(&self) -> Vec<Value> {
        self.lines()
            .iter()
            .map(|line| {
                serde_json::from_str(line)
                    .unwrap_or_else(|e| panic!("log line is not JSON ({e}): {line}"))
            })
            .collect()
    }

    /// Records whose message contains `needle`.
    pub fn with_message(&self, needle: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| {
                record["message"]
                    .as_str()
                    .is_some_and(|message| message.contains(needle))
            })
            .collect()
    }

    /// Records carrying `request_id`.
    pub fn for_request(&self, request_id: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| record["request_id"].as_str() == Some(request_id))
            .collect()
    }

    pub fn raw(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}
