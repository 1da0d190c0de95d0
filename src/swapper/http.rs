use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{
    CooperativeRefundRequest, CooperativeRefundResponse, ReverseSwapRequest, ReverseSwapResponse,
    SubmarineSwapRequest, SubmarineSwapResponse, SwapProvider,
};
use crate::error::SwapperError;

/// JSON-over-HTTP swap provider client.
#[derive(Debug, Clone)]
pub struct HttpSwapProvider {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

impl HttpSwapProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T: DeserializeOwned, R: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &R,
    ) -> Result<T, SwapperError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SwapperError::Http(format!("send request to {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(err) => err.error,
                Err(_) => "unknown error".to_string(),
            };
            return Err(SwapperError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| SwapperError::Http(format!("read response: {e}")))?;
        tracing::debug!(%url, body = %text, "swap provider response");

        serde_json::from_str(&text)
            .map_err(|e| SwapperError::Parse(format!("{e}. Body: {text}")))
    }
}

#[async_trait]
impl SwapProvider for HttpSwapProvider {
    async fn create_reverse_swap(
        &self,
        request: &ReverseSwapRequest,
    ) -> Result<ReverseSwapResponse, SwapperError> {
        self.post_json("/v2/swap/reverse", request).await
    }

    async fn create_submarine_swap(
        &self,
        request: &SubmarineSwapRequest,
    ) -> Result<SubmarineSwapResponse, SwapperError> {
        self.post_json("/v2/swap/submarine", request).await
    }

    async fn sign_cooperative_refund(
        &self,
        swap_id: &str,
        request: &CooperativeRefundRequest,
    ) -> Result<CooperativeRefundResponse, SwapperError> {
        self.post_json(&format!("/v2/swap/submarine/{swap_id}/refund"), request)
            .await
    }
}
