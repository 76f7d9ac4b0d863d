//! 调用元数据
//!
//! 亲和键和幂等标记都通过调用自带的 string→string 元数据传递，
//! 这里把 HashMap、tonic MetadataMap、HTTP HeaderMap 统一成只读接口。

use std::collections::HashMap;

/// 幂等标记所在的 metadata 字段
pub const IDEMPOTENT_KEY: &str = "is_idempotent";

/// 幂等标记的取值
pub const IDEMPOTENT_VALUE: &str = "1";

/// 元数据载体
pub trait MetadataCarrier {
    /// 读取字段的第一个值
    fn get(&self, key: &str) -> Option<&str>;

    /// 调用方是否显式声明该调用幂等
    fn is_idempotent(&self) -> bool {
        self.get(IDEMPOTENT_KEY) == Some(IDEMPOTENT_VALUE)
    }
}

impl MetadataCarrier for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl MetadataCarrier for tonic::metadata::MetadataMap {
    fn get(&self, key: &str) -> Option<&str> {
        tonic::metadata::MetadataMap::get(self, key).and_then(|v| v.to_str().ok())
    }
}

impl MetadataCarrier for http::HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        http::HeaderMap::get(self, key).and_then(|v| v.to_str().ok())
    }
}

impl<T: MetadataCarrier + ?Sized> MetadataCarrier for &T {
    fn get(&self, key: &str) -> Option<&str> {
        (**self).get(key)
    }
}
