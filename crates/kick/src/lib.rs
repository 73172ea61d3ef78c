pub mod client;

pub use client::{KickApiClient, KickApiError, KickChannel, SendChatMessageRequest};
