//! Handler traits - 名前で呼び出される関数の定義
//!
//! # 二層構造
//! - **表層（Typed）**: `Function<A>`, `Prepare<T>` - 引数を型で受け取る
//! - **内部（Dyn）**: `BusinessFunction`, `BeforeHandler`, `SuccessHandler`,
//!   `ErrorHandler` - object-safe, registry に格納される
//!
//! Typed 側は `TypedFunction` / `TypedBefore` で Dyn 側に変換します
//! （type erasure）。デコード失敗は validation result になります。

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::codec::PayloadCodec;
use super::task::Args;
use crate::domain::{
    AttemptRef, ChannelPayload, EngineError, ErrorEnvelope, HandlerResult, SuccessEnvelope,
};

/// `engine.function` task から名前で呼ばれる関数
#[async_trait]
pub trait BusinessFunction: Send + Sync {
    async fn call(&self, args: serde_json::Value) -> Result<HandlerResult, EngineError>;
}

/// Provider 向けの payload を組み立てる。読み取り専用。
///
/// ok 以外を返すと provider は呼ばれません。
#[async_trait]
pub trait BeforeHandler: Send + Sync {
    async fn before(&self, payload: &ChannelPayload) -> Result<HandlerResult, EngineError>;
}

/// Attempt に success fact を書く。重複配送に対して冪等であること。
#[async_trait]
pub trait SuccessHandler: Send + Sync {
    async fn on_success(&self, envelope: &SuccessEnvelope) -> Result<HandlerResult, EngineError>;
}

/// Attempt に failure fact を書く。冪等で、想定内の失敗で Err を返さないこと。
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, envelope: &ErrorEnvelope) -> Result<HandlerResult, EngineError>;
}

/// 型付き business function
///
/// # 使用例
/// ```ignore
/// struct SendDigestFn;
///
/// #[async_trait]
/// impl Function<SendDigest> for SendDigestFn {
///     async fn call(&self, args: SendDigest) -> Result<HandlerResult, EngineError> {
///         Ok(HandlerResult::ok())
///     }
/// }
/// ```
#[async_trait]
pub trait Function<A: Args>: Send + Sync {
    async fn call(&self, args: A) -> Result<HandlerResult, EngineError>;
}

pub struct TypedFunction<A: Args, F: Function<A>> {
    function: F,
    _marker: PhantomData<A>,
}

impl<A: Args, F: Function<A>> TypedFunction<A, F> {
    pub fn new(function: F) -> Self {
        Self {
            function,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Args, F: Function<A>> BusinessFunction for TypedFunction<A, F> {
    async fn call(&self, args: serde_json::Value) -> Result<HandlerResult, EngineError> {
        match PayloadCodec::decode::<A>(&args) {
            Ok(args) => self.function.call(args).await,
            Err(e) => Ok(e.into()),
        }
    }
}

/// 型付き before handler。`data`（root の metadata）を `T` として受け取る。
#[async_trait]
pub trait Prepare<T>: Send + Sync
where
    T: DeserializeOwned + Send + 'static,
{
    async fn prepare(&self, attempt: &AttemptRef, data: T) -> Result<HandlerResult, EngineError>;
}

pub struct TypedBefore<T, P> {
    prepare: P,
    _marker: PhantomData<fn() -> T>,
}

impl<T, P> TypedBefore<T, P>
where
    T: DeserializeOwned + Send + 'static,
    P: Prepare<T>,
{
    pub fn new(prepare: P) -> Self {
        Self {
            prepare,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, P> BeforeHandler for TypedBefore<T, P>
where
    T: DeserializeOwned + Send + 'static,
    P: Prepare<T>,
{
    async fn before(&self, payload: &ChannelPayload) -> Result<HandlerResult, EngineError> {
        match PayloadCodec::decode::<T>(&payload.data) {
            Ok(data) => self.prepare.prepare(&payload.attempt, data).await,
            Err(e) => Ok(e.into()),
        }
    }
}
