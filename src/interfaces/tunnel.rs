use async_trait::async_trait;

use crate::core::error::Result;

/// 隧道控制接口
///
/// 同一时刻只维持一条活动隧道；`connect` 会替换此前的出口。
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn connect(&self, address: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// 校验出口可达 (例如能否取回出口 IP)
    async fn health_check(&self) -> Result<bool>;
}
