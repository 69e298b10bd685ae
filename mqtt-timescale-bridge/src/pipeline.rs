//! Decode-and-persist message handler.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::codec;
use crate::sink::ReadingSink;

// ------------------------------------------------------------------ //
//  Handler contract                                                   //
// ------------------------------------------------------------------ //

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stored,
    /// Payload could not be decoded; nothing was written.
    Rejected,
    /// Payload decoded but the store refused or lost it.
    WriteFailed,
}

/// Callback invoked by the subscription client for every inbound message.
///
/// The client awaits each call to completion before polling for the next
/// message, so implementations see messages strictly one at a time.
#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, topic: &str, payload: &[u8]) -> Outcome;
}

/// Running totals, logged at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub stored: u64,
    pub decode_failed: u64,
    pub write_failed: u64,
}

// ------------------------------------------------------------------ //
//  Pipeline                                                           //
// ------------------------------------------------------------------ //

/// Decoder followed by a [`ReadingSink`]. Owns the sink for its lifetime.
pub struct Pipeline<S> {
    sink: S,
    stats: PipelineStats,
}

impl<S: ReadingSink> Pipeline<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[async_trait]
impl<S: ReadingSink> MessageHandler for Pipeline<S> {
    async fn handle(&mut self, topic: &str, payload: &[u8]) -> Outcome {
        self.stats.received += 1;
        debug!(topic, payload = %String::from_utf8_lossy(payload), "MQTT message");

        let reading = match codec::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                self.stats.decode_failed += 1;
                warn!(topic, error = %e, "dropping undecodable message");
                return Outcome::Rejected;
            }
        };

        match self.sink.write(&reading).await {
            Ok(()) => {
                self.stats.stored += 1;
                Outcome::Stored
            }
            Err(e) => {
                self.stats.write_failed += 1;
                error!(
                    topic,
                    device_id = %reading.device_id,
                    path = %reading.path,
                    error = %e,
                    "write failed, message dropped"
                );
                Outcome::WriteFailed
            }
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
