use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use tracing::debug;

use crate::core::config::CollectorConfig;
use crate::core::error::{CollectError, Result};
use crate::network::middleware::{BlockDetectMiddleware, HeaderMiddleware};

/// 出站 HTTP 服务
///
/// 所有请求经由实例专属的本地代理端口发出，实际出口由隧道池当前选中的节点决定。
#[derive(Clone)]
pub struct HttpService {
    client: ClientWithMiddleware,
    timeout_secs: u64,
}

impl HttpService {
    pub fn new(proxy_url: Option<&str>, config: &CollectorConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout());

        builder = match proxy_url {
            Some(url) => builder.proxy(
                reqwest::Proxy::all(url)
                    .map_err(|e| CollectError::TunnelConnection(format!("invalid proxy: {}", e)))?,
            ),
            None => builder.no_proxy(),
        };

        let client = builder
            .build()
            .map_err(|e| CollectError::TunnelConnection(e.to_string()))?;

        Ok(Self {
            client: ClientBuilder::new(client)
                .with(HeaderMiddleware::new(&config.user_agent))
                .with(BlockDetectMiddleware)
                .build(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// GET 并读取文本；非 2xx 状态、超时与传输错误都映射为采集错误
    pub async fn get_text(&self, url: &str) -> Result<(u16, String)> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CollectError::from_middleware(e, self.timeout_secs))?;

        let status = resp.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "非成功响应");
            return Err(CollectError::from_status(status));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| CollectError::from_transport(&e, self.timeout_secs))?;
        Ok((status.as_u16(), text))
    }
}
