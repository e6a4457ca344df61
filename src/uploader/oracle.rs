// 存在性查询
//
// 把待上传的 key 按批次发给存储的 exists 接口，合并结果。
// 查询失败时按"不存在"处理（fail-open），冲突检测只是提示性的，
// 不应阻塞上传。

use crate::storage::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 单次存在性查询的最大 key 数量
pub const DEFAULT_EXISTS_BATCH_SIZE: usize = 500;

/// 存在性查询客户端
pub struct ExistenceOracle {
    store: Arc<dyn ObjectStore>,
    batch_size: usize,
}

impl ExistenceOracle {
    pub fn new(store: Arc<dyn ObjectStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 查询一组 key 是否存在
    ///
    /// 批次顺序执行；某一批失败时该批全部记为 false，继续后续批次。
    /// 服务端未返回的 key 同样记为 false。
    pub async fn check(&self, keys: &[String]) -> HashMap<String, bool> {
        let mut result = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return result;
        }

        for (index, chunk) in keys.chunks(self.batch_size).enumerate() {
            match self.store.exists_batch(chunk).await {
                Ok(answer) => {
                    for key in chunk {
                        let exists = answer.get(key).copied().unwrap_or(false);
                        result.insert(key.clone(), exists);
                    }
                }
                Err(e) => {
                    warn!(
                        "存在性查询失败，第 {} 批 {} 个 key 按不存在处理: {}",
                        index + 1,
                        chunk.len(),
                        e
                    );
                    for key in chunk {
                        result.insert(key.clone(), false);
                    }
                }
            }
        }

        debug!(
            "存在性查询完成: 共 {} 个, 已存在 {} 个",
            result.len(),
            result.values().filter(|v| **v).count()
        );
        result
    }
}
