//! 子进程任务执行器
//!
//! 每个任务在独立子进程中执行（默认重新调用宿主二进制的runner
//! 入口），任务代码崩溃或泄漏不会拖垮Worker本体；超时通过强制
//! 终止子进程实现。调用载荷经stdin传入，结构化结果写入临时
//! 结果文件，标准输出与标准错误整体捕获进Run记录。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{info, warn};

use jobq_core::{
    models::{RunStatus, Task},
    SchedulerError, SchedulerResult,
};

/// 传给子进程的调用载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerPayload {
    pub function: String,
    pub args: Vec<serde_json::Value>,
    pub vars: serde_json::Map<String, serde_json::Value>,
}

/// 子进程写入结果文件的信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerEnvelope {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// 一次子进程执行的结果
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: RunStatus,
    pub output: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl ExecutionOutcome {
    fn failed(message: String) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            result: None,
            error_message: Some(message),
        }
    }
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

pub struct SubprocessExecutor {
    program: PathBuf,
    base_args: Vec<String>,
    /// run_id → 子进程pid，取消时按pid终止
    running: Arc<RwLock<HashMap<i64, u32>>>,
}

impl SubprocessExecutor {
    /// 以当前二进制的runner入口作为子进程
    pub fn current_exe() -> SchedulerResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| SchedulerError::Internal(format!("无法定位当前可执行文件: {e}")))?;
        Ok(Self::new(program, vec!["run-function".to_string()]))
    }

    pub fn new(program: PathBuf, base_args: Vec<String>) -> Self {
        Self {
            program,
            base_args,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 执行一个任务，阻塞直到子进程退出、超时或被取消
    pub async fn execute(&self, run_id: i64, task: &Task) -> ExecutionOutcome {
        let payload = RunnerPayload {
            function: task.function_name.clone(),
            args: task.args.as_array().cloned().unwrap_or_default(),
            vars: task.vars.as_object().cloned().unwrap_or_default(),
        };
        let payload_bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => return ExecutionOutcome::failed(format!("序列化调用载荷失败: {e}")),
        };

        // 结果文件随句柄生命周期自动清理
        let result_file = match tempfile::NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => return ExecutionOutcome::failed(format!("创建结果文件失败: {e}")),
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .arg(result_file.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionOutcome::failed(format!("启动子进程失败: {e}")),
        };

        if let Some(pid) = child.id() {
            self.running.write().await.insert(run_id, pid);
        }

        // 子进程可能不读stdin，写入失败不视为错误
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.write_all(&payload_bytes).await;
            let _ = stdin.shutdown().await;
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read_output = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(stream) = stdout.as_mut() {
                let _ = stream.read_to_end(&mut out).await;
            }
            if let Some(stream) = stderr.as_mut() {
                let _ = stream.read_to_end(&mut err).await;
            }
            (out, err)
        };

        let timeout = std::time::Duration::from_secs(task.timeout_seconds.max(1) as u64);
        let wait_child = async {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => WaitOutcome::Exited(result),
                Err(_) => {
                    // 超时：强杀子进程，管道关闭后输出读取随之结束
                    warn!("任务 {} 执行超过 {:?}，强制终止", task.id, timeout);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    WaitOutcome::TimedOut
                }
            }
        };

        let ((out_bytes, err_bytes), wait_outcome) = tokio::join!(read_output, wait_child);
        self.running.write().await.remove(&run_id);

        let output = combine_output(&out_bytes, &err_bytes);
        match wait_outcome {
            WaitOutcome::TimedOut => ExecutionOutcome {
                status: RunStatus::Timeout,
                output,
                result: None,
                error_message: Some(format!(
                    "执行超过{}秒被强制终止",
                    task.timeout_seconds.max(1)
                )),
            },
            WaitOutcome::Exited(Err(e)) => ExecutionOutcome {
                status: RunStatus::Failed,
                output,
                result: None,
                error_message: Some(format!("等待子进程失败: {e}")),
            },
            WaitOutcome::Exited(Ok(status)) => {
                let envelope = read_envelope(result_file.path()).await;
                match envelope {
                    Some(envelope) if envelope.success => ExecutionOutcome {
                        status: RunStatus::Completed,
                        output,
                        result: envelope.result,
                        error_message: None,
                    },
                    Some(envelope) => ExecutionOutcome {
                        status: RunStatus::Failed,
                        output,
                        result: None,
                        error_message: envelope.error.or_else(|| Some("任务函数执行失败".to_string())),
                    },
                    None if status.success() => ExecutionOutcome {
                        status: RunStatus::Completed,
                        output,
                        result: None,
                        error_message: None,
                    },
                    None => ExecutionOutcome {
                        status: RunStatus::Failed,
                        output,
                        result: None,
                        error_message: Some(format!("子进程异常退出，退出码: {:?}", status.code())),
                    },
                }
            }
        }
    }

    /// 终止正在执行的子进程，返回是否找到对应进程
    pub async fn cancel(&self, run_id: i64) -> bool {
        let pid = self.running.write().await.remove(&run_id);
        match pid {
            Some(pid) => {
                #[cfg(unix)]
                {
                    match std::process::Command::new("kill")
                        .arg("-9")
                        .arg(pid.to_string())
                        .output()
                    {
                        Ok(output) if output.status.success() => {
                            info!("已终止运行 {} 的子进程 (pid {})", run_id, pid);
                            true
                        }
                        Ok(output) => {
                            warn!(
                                "终止运行 {} 的子进程失败: {}",
                                run_id,
                                String::from_utf8_lossy(&output.stderr)
                            );
                            false
                        }
                        Err(e) => {
                            warn!("终止运行 {} 的子进程失败: {}", run_id, e);
                            false
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    warn!("当前平台不支持按pid终止子进程 (pid {pid})");
                    false
                }
            }
            None => false,
        }
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> Option<String> {
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    let combined = match (out.trim().is_empty(), err.trim().is_empty()) {
        (true, true) => return None,
        (false, true) => out.trim_end().to_string(),
        (true, false) => err.trim_end().to_string(),
        (false, false) => format!("{}\n{}", out.trim_end(), err.trim_end()),
    };
    Some(combined)
}

async fn read_envelope(path: &Path) -> Option<RunnerEnvelope> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    if content.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&content).ok()
}
