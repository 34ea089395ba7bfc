use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::core::config::{EndpointConfig, SingboxConfig};
use crate::core::error::CollectError;
use crate::interfaces::TunnelControl;

/// sing-box 隧道控制器
///
/// 每个实例独占一个 sing-box 进程与一组端口；出口切换通过 Clash API 的选择器完成。
pub struct SingBoxController {
    executable: PathBuf,
    config_path: PathBuf,
    api_base: Url,
    api_secret: String,
    selector: String,
    idle_outbound: String,
    health_url: String,
    child: Mutex<Option<Child>>,
    client: Client,
    probe: Client,
}

impl SingBoxController {
    pub fn new(config: &SingboxConfig, work_dir: &Path) -> Result<Self> {
        // 自动处理不同系统的扩展名 (Windows 为 .exe，Linux/Mac 为空)
        let executable = Path::new(&config.bin_path).join(format!("sing-box{}", EXE_SUFFIX));
        let config_path = match &config.config_file {
            Some(path) => PathBuf::from(path),
            None => work_dir.join("config.json"),
        };

        let api_base = Url::parse(&format!("http://127.0.0.1:{}", config.api_port))
            .context("Invalid API URL construction")?;

        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        // 探测请求必须走本地代理，才能验证出口本身
        let probe = Client::builder()
            .proxy(reqwest::Proxy::all(config.proxy_url()).context("Invalid proxy URL")?)
            .timeout(Duration::from_secs(config.health_timeout_secs))
            .build()
            .context("Failed to build probe client")?;

        Ok(Self {
            executable,
            config_path,
            api_base,
            api_secret: config.api_secret.clone(),
            selector: config.selector.clone(),
            idle_outbound: config.idle_outbound.clone(),
            health_url: config.health_url.clone(),
            child: Mutex::new(None),
            client,
            probe,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn write_config(&self, config_content: &str) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }
        tokio::fs::write(&self.config_path, config_content)
            .await
            .context("Failed to write config file")?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let mut child_guard = self.child.lock().await;
        if child_guard.is_some() {
            debug!("sing-box 已经在运行中");
            return Ok(());
        }

        if !self.executable.exists() {
            return Err(anyhow!("未找到 sing-box 执行文件: {}", self.executable.display()));
        }

        let log_path = self.config_path.with_file_name("sing-box.log");
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("无法打开 sing-box 日志文件")?;

        info!(config = %self.config_path.display(), "正在启动 sing-box...");

        let child = Command::new(&self.executable)
            .arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true)
            .spawn()
            .context("启动 sing-box 进程失败")?;

        *child_guard = Some(child);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            child.kill().await.context("无法停止 sing-box")?;
            child.wait().await.context("等待 sing-box 退出失败")?;
            info!("sing-box 已停止");
        }
        Ok(())
    }

    pub async fn wait_for_api(&self, timeout_secs: u64) -> Result<()> {
        let url = self.api_base.join("proxies")?;

        timeout(Duration::from_secs(timeout_secs), async {
            loop {
                match self
                    .client
                    .get(url.clone())
                    .bearer_auth(&self.api_secret)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("sing-box API 已就绪");
                        return;
                    }
                    _ => debug!("正在等待 sing-box API 响应..."),
                }
                sleep(Duration::from_millis(500)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("等待 sing-box API 超时"))
    }

    /// 渲染配置 (或沿用外部配置) 并拉起进程，直到 API 可用
    pub async fn launch(&self, endpoints: &[EndpointConfig], singbox: &SingboxConfig) -> Result<()> {
        if singbox.config_file.is_none() {
            let content = render_config(endpoints, singbox, &self.config_path)?;
            self.write_config(&content).await?;
        }
        self.start().await?;
        self.wait_for_api(10).await
    }

    pub async fn switch_selector(&self, selector: &str, tag: &str) -> Result<()> {
        let url = self.api_base.join(&format!("proxies/{}", selector))?;
        let body = json!({ "name": tag });

        let resp = self
            .client
            .put(url)
            .bearer_auth(&self.api_secret)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Failed to switch proxy ({} -> {}): Status {}, Body: {}",
                selector,
                tag,
                status,
                text
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl TunnelControl for SingBoxController {
    async fn connect(&self, address: &str) -> crate::core::error::Result<()> {
        self.switch_selector(&self.selector, address)
            .await
            .map_err(|e| CollectError::TunnelConnection(format!("{:#}", e)))
    }

    async fn disconnect(&self) -> crate::core::error::Result<()> {
        self.switch_selector(&self.selector, &self.idle_outbound)
            .await
            .map_err(|e| CollectError::TunnelConnection(format!("{:#}", e)))
    }

    async fn health_check(&self) -> crate::core::error::Result<bool> {
        let resp = self
            .probe
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| CollectError::TunnelConnection(e.to_string()))?;

        if !resp.status().is_success() {
            warn!(status = resp.status().as_u16(), "出口探测返回异常状态");
            return Ok(false);
        }

        let info: Value = resp
            .json()
            .await
            .map_err(|e| CollectError::TunnelConnection(e.to_string()))?;
        match info.get("ip").and_then(Value::as_str) {
            Some(ip) => {
                let city = info.get("city").and_then(Value::as_str).unwrap_or("unknown");
                info!(ip, city, "出口已验证");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// 生成面向 sing-box 的运行时 JSON 配置文件
///
/// 每个节点渲染为一个 WireGuard 出口，标签即节点地址；选择器默认指向空闲出站，
/// 由 `connect` 显式切换。
pub fn render_config(
    endpoints: &[EndpointConfig],
    singbox: &SingboxConfig,
    config_path: &Path,
) -> Result<String> {
    if endpoints.is_empty() {
        return Err(anyhow!("Endpoint set is empty, configuration aborted"));
    }
    let private_key = singbox
        .private_key
        .as_deref()
        .ok_or_else(|| anyhow!("singbox.private_key is required to render WireGuard endpoints"))?;

    let mut wireguard = Vec::with_capacity(endpoints.len());
    for ep in endpoints {
        let public_key = ep
            .public_key
            .as_deref()
            .ok_or_else(|| anyhow!("endpoint {} has no public_key", ep.address))?;
        wireguard.push(json!({
            "type": "wireguard",
            "tag": ep.address,
            "address": singbox.local_address,
            "private_key": private_key,
            "peers": [{
                "address": ep.server.as_deref().unwrap_or(&ep.address),
                "port": ep.server_port,
                "public_key": public_key,
                "allowed_ips": ["0.0.0.0/0", "::/0"]
            }]
        }));
    }

    let mut selectable: Vec<&str> = endpoints.iter().map(|e| e.address.as_str()).collect();
    selectable.push(&singbox.idle_outbound);

    let cache_db = config_path.with_file_name("cache.db");

    let config = json!({
        "log": { "level": "warn" },
        "dns": {
            "servers": [{ "type": "https", "tag": "dns-remote", "server": "1.1.1.1" }],
            "final": "dns-remote"
        },
        "inbounds": [{
            "type": "mixed", "tag": "proxy-in", "listen": "127.0.0.1", "listen_port": singbox.proxy_port
        }],
        "endpoints": wireguard,
        "outbounds": [
            { "type": "direct", "tag": "direct" },
            { "type": "block", "tag": singbox.idle_outbound },
            {
                "type": "selector",
                "tag": singbox.selector,
                "outbounds": selectable,
                "default": singbox.idle_outbound,
                "interrupt_exist_connections": true
            }
        ],
        "route": {
            "rules": [
                { "protocol": "dns", "outbound": "direct" },
                { "outbound": singbox.selector, "inbound": "proxy-in" }
            ],
            "final": "direct",
            "auto_detect_interface": true
        },
        "experimental": {
            "clash_api": {
                "external_controller": format!("127.0.0.1:{}", singbox.api_port),
                "secret": singbox.api_secret
            },
            "cache_file": {
                "enabled": true,
                "path": cache_db.to_string_lossy()
            }
        }
    });

    serde_json::to_string_pretty(&config).context("Config serialization failed")
}
