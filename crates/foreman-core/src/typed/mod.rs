//! Typed - 型付き handler API
//!
//! このモジュールは function 名の typo を型で排除し、
//! 名前と実装の対応を起動時に確定させます。
//!
//! # 二層構造
//! - **表層（Typed）**: `Args`, `Function<A>`, `Prepare<T>` - 型安全
//! - **内部（Dyn）**: `BusinessFunction` ほか - object-safe, type erasure

pub mod codec;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::{CodecError, PayloadCodec};
pub use self::handler::{
    BeforeHandler, BusinessFunction, ErrorHandler, Function, Prepare, SuccessHandler,
    TypedBefore, TypedFunction,
};
pub use self::registry::{HandlerKind, HandlerRegistry};
pub use self::task::Args;
