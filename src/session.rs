use async_trait::async_trait;

use crate::{MinerError, PreparedRequest, Response, Result, SendOptions};

/// Transport capability used by the retry executor.
///
/// One call is one attempt. Implementations report transport failures as
/// errors and return every received response, whatever its status; the
/// executor performs the status check itself.
#[async_trait]
pub trait Session: Send + Sync {
    async fn send(&self, request: &PreparedRequest, options: &SendOptions) -> Result<Response>;
}

#[async_trait]
impl Session for reqwest::Client {
    async fn send(&self, request: &PreparedRequest, options: &SendOptions) -> Result<Response> {
        let mut builder = self
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(MinerError::Transport)?;
        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(MinerError::Transport)?;

        Ok(Response::new(status, body)
            .with_url(url)
            .with_headers(headers))
    }
}

#[async_trait]
impl<S: Session + ?Sized> Session for std::sync::Arc<S> {
    async fn send(&self, request: &PreparedRequest, options: &SendOptions) -> Result<Response> {
        (**self).send(request, options).await
    }
}
