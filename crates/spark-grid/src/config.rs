use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// 节点级协议配置。
///
/// - `concurrent`：为 `true` 时，入站请求在能够无阻塞进入预处理闸门的情况下直接在接收线程上处理；
/// - `key_request_retry_limit`：键请求在结果为“响应未知”时按最新归属重发的次数上限，
///   租约请求与多分区请求的重新提交共享同一上限；
/// - `default_request_timeout_millis`：请求未指定超时时使用的默认值，0 表示不超时。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub concurrent: bool,
    pub key_request_retry_limit: u32,
    pub default_request_timeout_millis: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            concurrent: true,
            key_request_retry_limit: 3,
            default_request_timeout_millis: 0,
        }
    }
}

impl GridConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, GridError> {
        let config: Self = toml::from_str(source).map_err(|err| GridError::InvalidConfig {
            reason: format!("malformed toml: {err}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GridError> {
        if self.key_request_retry_limit > 64 {
            return Err(GridError::InvalidConfig {
                reason: format!(
                    "key_request_retry_limit {} exceeds 64",
                    self.key_request_retry_limit
                ),
            });
        }
        Ok(())
    }
}
