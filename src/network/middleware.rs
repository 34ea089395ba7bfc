use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use tracing::warn;

use crate::core::error::{BlockReason, CollectError};

/// 请求头注入中间件
///
/// 固定 UA 与语言，保证搜索页返回稳定的英文结构；请求自身已携带的头不覆盖。
pub struct HeaderMiddleware {
    headers: HeaderMap,
}

impl HeaderMiddleware {
    pub fn new(user_agent: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, val);
        }
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        Self { headers }
    }
}

#[async_trait::async_trait]
impl Middleware for HeaderMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let target = req.headers_mut();
        for (k, v) in self.headers.iter() {
            if !target.contains_key(k) {
                target.insert(k.clone(), v.clone());
            }
        }
        next.run(req, extensions).await
    }
}

/// 封禁检测中间件
///
/// 纯粹的监测哨：发现封禁只管报错，恢复 (切换出口、重试) 交给上层 Worker 调度。
pub struct BlockDetectMiddleware;

#[async_trait::async_trait]
impl Middleware for BlockDetectMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let resp = next.run(req, extensions).await?;

        if let Some(reason) = detect_block(resp.status(), resp.url()) {
            warn!(status = resp.status().as_u16(), url = %resp.url(), "检测到出口封禁: {}", reason);
            return Err(reqwest_middleware::Error::from(anyhow::Error::new(
                CollectError::Blocked(reason),
            )));
        }

        Ok(resp)
    }
}

/// 根据最终响应判断出口是否被拦截
///
/// 除 403/429 外，被重定向到同意页或 `/sorry/` 验证码页同样说明当前出口不可用。
pub fn detect_block(status: StatusCode, final_url: &url::Url) -> Option<BlockReason> {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        return Some(BlockReason::from(status));
    }
    let host = final_url.host_str().unwrap_or_default();
    if host.starts_with("consent.") {
        return Some(BlockReason::Custom("consent wall".into()));
    }
    if final_url.path().starts_with("/sorry/") {
        return Some(BlockReason::Custom("captcha".into()));
    }
    None
}
