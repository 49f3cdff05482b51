//! Application state shared by all handlers.

use std::sync::Arc;

use parley_broker::Broker;

use crate::config::ServerConfig;

/// 应用状态 - 在 main.rs 中创建并共享给所有组件
#[derive(Clone)]
pub struct AppState {
    /// 消息代理实例
    pub broker: Arc<Broker>,
    /// 服务器配置
    pub config: ServerConfig,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(broker: Arc<Broker>, config: ServerConfig) -> Self {
        Self { broker, config }
    }
}
