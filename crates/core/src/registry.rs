//! 宿主应用提供的任务函数注册表
//!
//! 调度器从不接受或求值任意代码字符串：任务行上只存函数名，
//! 入队时对照注册表校验，执行时在隔离子进程内查表调用。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};

/// 一次函数调用的入参
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// 位置参数
    pub args: Vec<serde_json::Value>,
    /// 关键字参数
    pub vars: serde_json::Map<String, serde_json::Value>,
}

impl FunctionCall {
    pub fn new(args: Vec<serde_json::Value>, vars: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { args, vars }
    }
}

/// 可注册的任务函数
///
/// 函数体在任务专属的子进程内同步执行，返回值写入Run记录；
/// 超时与取消由父进程通过终止子进程实现，函数本身无需感知。
pub trait TaskFunction: Send + Sync {
    fn call(&self, call: &FunctionCall) -> SchedulerResult<serde_json::Value>;
}

impl<F> TaskFunction for F
where
    F: Fn(&FunctionCall) -> SchedulerResult<serde_json::Value> + Send + Sync,
{
    fn call(&self, call: &FunctionCall) -> SchedulerResult<serde_json::Value> {
        self(call)
    }
}

/// 函数名到可调用体的映射
///
/// 在进程启动时构建完毕，之后只读共享，不作为跨进程的权威状态。
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// 注册普通函数或闭包，空名称在注册时即被拒绝
    pub fn register<F>(&mut self, name: &str, function: F) -> SchedulerResult<()>
    where
        F: Fn(&FunctionCall) -> SchedulerResult<serde_json::Value> + Send + Sync + 'static,
    {
        self.register_arc(name, Arc::new(function))
    }

    /// 注册实现了[`TaskFunction`]的任意类型
    pub fn register_arc(
        &mut self,
        name: &str,
        function: Arc<dyn TaskFunction>,
    ) -> SchedulerResult<()> {
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(
                "函数名不能为空".to_string(),
            ));
        }
        self.functions.insert(name.to_string(), function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
