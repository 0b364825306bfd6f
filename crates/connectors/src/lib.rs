//! agg_connectors
//!
//! The source connector interface and the publisher interface (delivery
//! side), plus the in-memory/recording test doubles this repository runs
//! its own tests against. Concrete Telegram transports are out of scope;
//! these traits are the seam a production binary plugs them in behind.

pub mod connector;
pub mod publisher;

pub use connector::{ConnectorError, InMemoryConnector, Item, ItemStream, SourceConnector};
pub use publisher::{Destination, Publisher, PublishRequest, PublisherError, RecordingPublisher, TelegramPublisher};
