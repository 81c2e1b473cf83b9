use tokio::sync::broadcast;
use tracing::info;

/// 优雅关闭管理器
///
/// 所有长驻循环订阅同一个广播通道，收到信号后各自收尾退出。
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(8);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// 触发关闭，没有任何订阅者时也不报错
    pub fn shutdown(&self) {
        info!("触发优雅关闭");
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
