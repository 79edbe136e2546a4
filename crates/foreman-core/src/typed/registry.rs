//! HandlerRegistry - 名前付き関数の登録と解決
//!
//! 文字列キーから trait object への対応表です。起動時に一度だけ組み立て、
//! 以降は読み取り専用で共有します（`Arc<HandlerRegistry>`）。
//!
//! - 二重登録は登録時に `DuplicateHandler` で拒否
//! - 未登録の名前は `EngineBuilder::build()` で検出（呼び出し時ではなく）

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::handler::{
    BeforeHandler, BusinessFunction, ErrorHandler, Function, Prepare, SuccessHandler,
    TypedBefore, TypedFunction,
};
use super::task::Args;
use crate::domain::EngineError;

/// 関数の種類。名前空間は種類ごとに独立。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Function,
    Before,
    Success,
    Error,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandlerKind::Function => "function",
            HandlerKind::Before => "before",
            HandlerKind::Success => "success",
            HandlerKind::Error => "error",
        };
        f.write_str(s)
    }
}

fn insert<T: ?Sized>(
    map: &mut HashMap<String, Arc<T>>,
    kind: HandlerKind,
    name: String,
    value: Arc<T>,
) -> Result<(), EngineError> {
    if map.contains_key(&name) {
        return Err(EngineError::DuplicateHandler(format!("{kind}:{name}")));
    }
    map.insert(name, value);
    Ok(())
}

fn lookup<T: ?Sized>(
    map: &HashMap<String, Arc<T>>,
    kind: HandlerKind,
    name: &str,
) -> Result<Arc<T>, EngineError> {
    map.get(name)
        .cloned()
        .ok_or_else(|| EngineError::HandlerNotFound(format!("{kind}:{name}")))
}

#[derive(Default)]
pub struct HandlerRegistry {
    functions: HashMap<String, Arc<dyn BusinessFunction>>,
    before: HashMap<String, Arc<dyn BeforeHandler>>,
    success: HashMap<String, Arc<dyn SuccessHandler>>,
    error: HashMap<String, Arc<dyn ErrorHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `A::NAME` で登録する
    pub fn register_function<A, F>(&mut self, function: F) -> Result<(), EngineError>
    where
        A: Args,
        F: Function<A> + 'static,
    {
        self.register_function_dyn(A::NAME, Arc::new(TypedFunction::new(function)))
    }

    pub fn register_function_dyn(
        &mut self,
        name: impl Into<String>,
        function: Arc<dyn BusinessFunction>,
    ) -> Result<(), EngineError> {
        insert(&mut self.functions, HandlerKind::Function, name.into(), function)
    }

    pub fn register_prepare<T, P>(
        &mut self,
        name: impl Into<String>,
        prepare: P,
    ) -> Result<(), EngineError>
    where
        T: DeserializeOwned + Send + 'static,
        P: Prepare<T> + 'static,
    {
        self.register_before(name, Arc::new(TypedBefore::<T, P>::new(prepare)))
    }

    pub fn register_before(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn BeforeHandler>,
    ) -> Result<(), EngineError> {
        insert(&mut self.before, HandlerKind::Before, name.into(), handler)
    }

    pub fn register_success(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn SuccessHandler>,
    ) -> Result<(), EngineError> {
        insert(&mut self.success, HandlerKind::Success, name.into(), handler)
    }

    pub fn register_error(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<(), EngineError> {
        insert(&mut self.error, HandlerKind::Error, name.into(), handler)
    }

    pub fn function(&self, name: &str) -> Result<Arc<dyn BusinessFunction>, EngineError> {
        lookup(&self.functions, HandlerKind::Function, name)
    }

    pub fn before(&self, name: &str) -> Result<Arc<dyn BeforeHandler>, EngineError> {
        lookup(&self.before, HandlerKind::Before, name)
    }

    pub fn success(&self, name: &str) -> Result<Arc<dyn SuccessHandler>, EngineError> {
        lookup(&self.success, HandlerKind::Success, name)
    }

    pub fn error(&self, name: &str) -> Result<Arc<dyn ErrorHandler>, EngineError> {
        lookup(&self.error, HandlerKind::Error, name)
    }

    pub fn contains(&self, kind: HandlerKind, name: &str) -> bool {
        match kind {
            HandlerKind::Function => self.functions.contains_key(name),
            HandlerKind::Before => self.before.contains_key(name),
            HandlerKind::Success => self.success.contains_key(name),
            HandlerKind::Error => self.error.contains_key(name),
        }
    }

    /// Sorted, for stable log output.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelPayload, HandlerResult};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {}

    impl Args for Ping {
        const NAME: &'static str = "test.ping";
    }

    struct PingFn;

    #[async_trait]
    impl Function<Ping> for PingFn {
        async fn call(&self, _args: Ping) -> Result<HandlerResult, EngineError> {
            Ok(HandlerResult::ok())
        }
    }

    struct Noop;

    #[async_trait]
    impl BeforeHandler for Noop {
        async fn before(&self, _payload: &ChannelPayload) -> Result<HandlerResult, EngineError> {
            Ok(HandlerResult::ok())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register_function::<Ping, _>(PingFn).unwrap();

        assert!(registry.function(Ping::NAME).is_ok());
        assert!(registry.contains(HandlerKind::Function, Ping::NAME));
        assert_eq!(registry.function_names(), vec![Ping::NAME.to_string()]);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register_function::<Ping, _>(PingFn).unwrap();
        let err = registry.register_function::<Ping, _>(PingFn).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateHandler(ref n) if n == "function:test.ping"));
    }

    #[test]
    fn kinds_have_separate_namespaces() {
        let mut registry = HandlerRegistry::new();
        registry.register_before("same", Arc::new(Noop)).unwrap();
        registry
            .register_function_dyn("same", Arc::new(TypedFunction::<Ping, _>::new(PingFn)))
            .unwrap();

        assert!(registry.before("same").is_ok());
        assert!(registry.function("same").is_ok());
        assert!(registry.success("same").is_err());
    }

    #[test]
    fn unknown_name_is_handler_not_found() {
        let registry = HandlerRegistry::new();
        let err = registry.error("missing").err().unwrap();
        assert!(matches!(err, EngineError::HandlerNotFound(ref n) if n == "error:missing"));
    }
}
