pub mod converter;
pub mod openai;
pub mod reliable;

pub mod mock;

pub use mock::{MockGateway, MockResponse};
pub use openai::{EndpointConfig, OpenAiGateway};
pub use reliable::{ReliableConfig, ReliableGateway};
