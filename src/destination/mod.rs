//! Destination chain model: topics, naming, construction and resolution

pub mod chain;
pub mod naming;
pub mod resolver;
pub mod topic;

pub use chain::build_chain;
pub use naming::{SuffixNamer, TopicNamer};
pub use resolver::DestinationResolver;
pub use topic::{DestinationTopic, TopicKind};
