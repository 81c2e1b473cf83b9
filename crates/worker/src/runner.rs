//! 子进程runner入口
//!
//! 宿主二进制以`run-function <result_path>`再次调用自身时进入这里：
//! 从stdin读取调用载荷，在本进程内查注册表执行函数，把结果信封
//! 写入结果文件。任务函数的panic被捕获并转为失败信封，不产生
//! 额外输出污染。

use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use jobq_core::{FunctionCall, FunctionRegistry};

use crate::executor::{RunnerEnvelope, RunnerPayload};

/// 执行runner入口，返回进程退出码
pub fn run(registry: &FunctionRegistry, result_path: &Path) -> i32 {
    let envelope = run_inner(registry);
    let exit_code = if envelope.success { 0 } else { 1 };

    match serde_json::to_string(&envelope) {
        Ok(serialized) => {
            if let Err(e) = std::fs::write(result_path, serialized) {
                eprintln!("写入结果文件失败: {e}");
                return 1;
            }
        }
        Err(e) => {
            eprintln!("序列化结果信封失败: {e}");
            return 1;
        }
    }
    exit_code
}

fn run_inner(registry: &FunctionRegistry) -> RunnerEnvelope {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        return failure(format!("读取调用载荷失败: {e}"));
    }

    let payload: RunnerPayload = match serde_json::from_str(&input) {
        Ok(payload) => payload,
        Err(e) => return failure(format!("解析调用载荷失败: {e}")),
    };

    let function = match registry.get(&payload.function) {
        Some(function) => function,
        None => return failure(format!("未注册的任务函数: {}", payload.function)),
    };

    let call = FunctionCall::new(payload.args, payload.vars);
    let outcome = catch_unwind(AssertUnwindSafe(|| function.call(&call)));

    match outcome {
        Ok(Ok(value)) => RunnerEnvelope {
            success: true,
            result: Some(value),
            error: None,
        },
        Ok(Err(e)) => failure(e.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "任务函数panic".to_string());
            failure(format!("任务函数panic: {message}"))
        }
    }
}

fn failure(message: String) -> RunnerEnvelope {
    RunnerEnvelope {
        success: false,
        result: None,
        error: Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::SchedulerError;
    use serde_json::json;

    #[test]
    fn test_panic_becomes_failure_envelope() {
        let mut registry = FunctionRegistry::new();
        registry
            .register("explode", |_: &FunctionCall| -> jobq_core::SchedulerResult<serde_json::Value> {
                panic!("boom");
            })
            .unwrap();

        let function = registry.get("explode").unwrap();
        let call = FunctionCall::new(Vec::new(), serde_json::Map::new());
        let outcome = catch_unwind(AssertUnwindSafe(|| function.call(&call)));
        assert!(outcome.is_err());
    }

    #[test]
    fn test_error_envelope_carries_message() {
        let mut registry = FunctionRegistry::new();
        registry
            .register("fail", |_: &FunctionCall| {
                Err(SchedulerError::TaskExecution("磁盘已满".to_string()))
            })
            .unwrap();

        let function = registry.get("fail").unwrap();
        let call = FunctionCall::new(vec![json!(1)], serde_json::Map::new());
        let error = function.call(&call).unwrap_err();
        assert!(error.to_string().contains("磁盘已满"));
    }
}
