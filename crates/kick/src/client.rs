use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Client for the Kick public API endpoints the bridge needs: posting chat
/// replies as the bot and looking up channel metadata.
#[derive(Clone)]
pub struct KickApiClient {
    http: Client,
    base_url: Url,
}

impl KickApiClient {
    /// Creates a new client against the provided API base.
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// Posts a chat message to a broadcaster's channel as the bot account.
    pub async fn send_chat_message(
        &self,
        access_token: &str,
        request: &SendChatMessageRequest<'_>,
    ) -> Result<(), KickApiError> {
        let url = self.base_url.join("chat")?;
        let body = serde_json::json!({
            "broadcaster_user_id": request.broadcaster_user_id,
            "content": request.content,
            "type": "bot",
        });
        let response = self
            .authorized_request(Method::POST, url, access_token)
            .json(&body)
            .send()
            .await?;

        ensure_success(response).await
    }

    /// Fetches channel metadata for a broadcaster.
    pub async fn get_channel(
        &self,
        access_token: &str,
        broadcaster_user_id: i64,
    ) -> Result<Option<KickChannel>, KickApiError> {
        let mut url = self.base_url.join("channels")?;
        url.query_pairs_mut()
            .append_pair("broadcaster_user_id", &broadcaster_user_id.to_string());

        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await?;

        let page = parse_json::<KickChannelListResponse>(response).await?;
        Ok(page.data.into_iter().next())
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

/// Parameters for posting a chat message.
pub struct SendChatMessageRequest<'a> {
    pub broadcaster_user_id: i64,
    pub content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct KickChannelListResponse {
    #[serde(default)]
    data: Vec<KickChannel>,
}

/// Channel metadata returned by the channels endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KickChannel {
    pub broadcaster_user_id: i64,
    pub slug: String,
    #[serde(default)]
    pub stream_title: Option<String>,
    #[serde(default)]
    pub banner_picture: Option<String>,
}

/// Errors produced by the Kick API client.
#[derive(Debug, Error)]
pub enum KickApiError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<(), KickApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(KickApiError::Status { status, body });
    }
    Ok(())
}

async fn parse_json<T>(response: Response) -> Result<T, KickApiError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(KickApiError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(base_url: &Url) -> KickApiClient {
        KickApiClient::new(base_url.clone(), Client::builder().build().expect("client"))
    }

    #[tokio::test]
    async fn send_chat_message_posts_as_bot() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/public/v1/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/public/v1/chat")
                    .header("Authorization", "Bearer token")
                    .json_body(json!({
                        "broadcaster_user_id": 42,
                        "content": "Guesses are open!",
                        "type": "bot"
                    }));
                then.status(200).json_body(json!({
                    "data": { "is_sent": true, "message_id": "m-1" }
                }));
            })
            .await;

        client
            .send_chat_message(
                "token",
                &SendChatMessageRequest {
                    broadcaster_user_id: 42,
                    content: "Guesses are open!",
                },
            )
            .await
            .expect("send message");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_channel_parses_first_result() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/public/v1/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/public/v1/channels")
                    .query_param("broadcaster_user_id", "42");
                then.status(200).json_body(json!({
                    "data": [
                        {
                            "broadcaster_user_id": 42,
                            "slug": "streamer",
                            "stream_title": "degen hours",
                            "banner_picture": "https://example.com/banner.png"
                        }
                    ]
                }));
            })
            .await;

        let channel = client
            .get_channel("token", 42)
            .await
            .expect("get channel")
            .expect("channel present");
        mock.assert_async().await;

        assert_eq!(channel.slug, "streamer");
        assert_eq!(channel.stream_title.as_deref(), Some("degen hours"));
    }

    #[tokio::test]
    async fn get_channel_returns_none_for_empty_page() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/public/v1/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(GET).path("/public/v1/channels");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;

        let channel = client.get_channel("token", 42).await.expect("get channel");
        assert!(channel.is_none());
    }

    #[tokio::test]
    async fn error_status_returns_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/public/v1/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(POST).path("/public/v1/chat");
                then.status(401).body("unauthorized");
            })
            .await;

        let err = client
            .send_chat_message(
                "token",
                &SendChatMessageRequest {
                    broadcaster_user_id: 42,
                    content: "hi",
                },
            )
            .await
            .expect_err("should error");
        match err {
            KickApiError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "unauthorized");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
