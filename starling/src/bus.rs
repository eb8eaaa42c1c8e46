// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of starling.
//
// starling is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// starling is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with starling.  If not,
// see <http://www.gnu.org/licenses/>.

//! # bus
//!
//! Kafka plumbing: producer & consumer construction, the publish seam the handlers write to, and
//! the consumer loop that the three pipeline stages run inside.
//!
//! The loop is deliberately boring: one message at a time, the next read only after the previous
//! message's processing returns, offsets committed by hand. The broker paces the pipeline; the
//! delivery contract is at-least-once, and every handler downstream is idempotent, so the only
//! real decision this module owns is *when not to commit* (see [Disposition]).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    ClientConfig, Message,
};
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Deadline on any single publish; failing fast here matters more than delivery, since
/// redelivery of the originating message retries the publish anyway.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Not a failure: the distinguished value a consumer loop returns when asked to shut down.
    #[snafu(display("The {consumer} consumer received the shutdown signal"))]
    Cancelled { consumer: &'static str },
    #[snafu(display("Failed to create a Kafka consumer: {source}"))]
    CreateConsumer {
        source: KafkaError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create the Kafka producer: {source}"))]
    CreateProducer {
        source: KafkaError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to publish to {topic}: {source}"))]
    Publish {
        topic: String,
        source: KafkaError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to subscribe to {topic}: {source}"))]
    Subscribe {
        topic: String,
        source: KafkaError,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Was this "error" really just the shutdown signal?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Kafka connection configuration
///
/// Just the bootstrap servers for now; the interesting knobs (commit discipline, offset reset)
/// are fixed by the pipeline's semantics & set below rather than exposed.
#[derive(Clone, Debug)]
pub struct Config {
    pub brokers: String,
}

impl Config {
    pub fn new(brokers: impl Into<String>) -> Config {
        Config {
            brokers: brokers.into(),
        }
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");
        config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config.set("group.id", group);
        // Offsets are committed by the loop below, only after processing returns.
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           publishing                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The seam through which anything in starling publishes an event
///
/// Both the HTTP command path & the materialiser write through this trait, which is what lets
/// the tests swap-in a recording double & assert on exactly what would have hit the wire.
#[async_trait]
pub trait EventSink {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// The Kafka [EventSink]: a thin wrapper over an [rdkafka] [FutureProducer]
///
/// One instance is shared process-wide; [FutureProducer] is cheap to clone & safe for
/// concurrent use.
pub struct Producer {
    producer: FutureProducer,
}

impl Producer {
    pub fn new(config: &Config) -> Result<Producer> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .context(CreateProducerSnafu)?;
        info!("Connected to Kafka at {}.", config.brokers);
        Ok(Producer { producer })
    }
}

#[async_trait]
impl EventSink for Producer {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.producer
            .send(
                FutureRecord::to(topic).key(key).payload(payload),
                PUBLISH_TIMEOUT,
            )
            .await
            .map_err(|(err, _)| {
                PublishSnafu {
                    topic: topic.to_owned(),
                }
                .into_error(err)
            })?;
        debug!("Published {} bytes to {} under key {}.", payload.len(), topic, key);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           consuming                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What the consumer loop should do with the offset after a handler returns
///
/// [Commit](Disposition::Commit) acknowledges the message (including poison messages-- a
/// malformed document will never decode better on redelivery). [Hold](Disposition::Hold) leaves
/// the offset uncommitted so the broker redelivers after a restart or rebalance; handlers
/// reserve it for failures where retrying can actually change the outcome (a store that
/// couldn't be reached, say).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    Commit,
    Hold,
}

/// One stage of the pipeline: a thing that processes a single message's payload
///
/// Handlers do their own decoding, their own logging & their own error policy; all the loop
/// wants back is the offset decision. Notably `handle` is infallible-- the taxonomy of what can
/// go wrong belongs to each stage, and no failure of one message may take the loop down.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, payload: &[u8]) -> Disposition;
}

/// Build a [StreamConsumer] subscribed to `topic` under the consumer group `group`.
pub fn subscriber(config: &Config, group: &str, topic: &str) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = config
        .consumer_config(group)
        .create()
        .context(CreateConsumerSnafu)?;
    consumer.subscribe(&[topic]).context(SubscribeSnafu {
        topic: topic.to_owned(),
    })?;
    info!("Subscribed to {} as {}.", topic, group);
    Ok(consumer)
}

/// Drive `handler` over `consumer` until cancelled
///
/// Messages are processed strictly sequentially. On `shutdown` the loop stops reading & returns
/// [Error::Cancelled]; an in-flight message may be abandoned, which at-least-once delivery makes
/// safe. Broker-side read errors are logged & the loop keeps going-- the broker owns retry.
pub async fn consume<H: Handler>(
    consumer: StreamConsumer,
    handler: H,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let mut stream = consumer.stream();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("{} consumer shutting down.", handler.name());
                return CancelledSnafu { consumer: handler.name() }.fail();
            },
            next = stream.next() => {
                match next {
                    Some(Ok(message)) => {
                        let disposition = match message.payload() {
                            Some(payload) => handler.handle(payload).await,
                            None => {
                                warn!("{} received a message with no payload; skipping.",
                                      handler.name());
                                Disposition::Commit
                            }
                        };
                        match disposition {
                            Disposition::Commit => {
                                if let Err(err) =
                                    consumer.commit_message(&message, CommitMode::Async)
                                {
                                    error!("{} failed to commit offset {} on {}: {}",
                                           handler.name(), message.offset(), message.topic(),
                                           err);
                                }
                            }
                            Disposition::Hold => {
                                debug!("{} holding offset {} on {} for redelivery.",
                                       handler.name(), message.offset(), message.topic());
                            }
                        }
                    }
                    Some(Err(err)) => {
                        error!("{} read error: {}", handler.name(), err);
                    }
                    // `MessageStream` is endless while the consumer lives; if we get here
                    // something torched the client underneath us.
                    None => {
                        error!("{} message stream ended unexpectedly.", handler.name());
                        return Ok(());
                    }
                }
            },
        }
    }
}
