//! Args trait - 型付き business function の引数
//!
//! function 名と引数の型を対応付けます。名前の typo はコンパイル時に
//! 1 箇所（`NAME`）に閉じ込められます。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Args は business function の名前と引数型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendDigest {
///     user_id: String,
/// }
///
/// impl Args for SendDigest {
///     const NAME: &'static str = "digest.send";
/// }
/// ```
///
/// # 命名規約
/// - `{domain}.{action}`
/// - `supervise.` で始まる名前は supervisor が予約している
pub trait Args: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}
