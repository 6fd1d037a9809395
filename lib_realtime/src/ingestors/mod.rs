//! # Data Ingestors Module
//!
//! Everything between the external event stream and `Hub::broadcast`.
//!
//! ## Contained Modules:
//! - **`decode`**: turns one stream payload into one or more records.
//! - **`stream_bridge`**: the consume loop, generic over a [`MessageSource`].
//! - **`kafka_source`**: consumer-group `MessageSource` over rdkafka
//!   (feature `kafka`).

#![forbid(unsafe_code)]

/// Payload decoding.
pub mod decode;
/// Consume loop and the source abstraction.
pub mod stream_bridge;
/// rdkafka consumer-group source.
#[cfg(feature = "kafka")]
pub mod kafka_source;

pub use decode::{decode_payload, DecodeError};
pub use stream_bridge::{BridgeConfig, InboundMessage, MessageSource, StreamBridge, StreamError};
#[cfg(feature = "kafka")]
pub use kafka_source::{KafkaConfig, KafkaSource};
