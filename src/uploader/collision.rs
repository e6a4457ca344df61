// 命名冲突处理
//
// 批次提交前，对已存在的目标 key 按用户选择的策略处理：
// - overwrite：直接覆盖
// - skip：跳过已存在的文件
// - rename：在扩展名前追加 " (N)"，直到得到一个未被占用的 key

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

/// 冲突处理策略，每个批次选择一次
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// 覆盖
    Overwrite,
    /// 跳过
    Skip,
    /// 重命名
    Rename,
}

impl CollisionPolicy {
    /// 宽松解析用户的回答：s 开头为跳过，r 开头为重命名，其余均为覆盖
    pub fn from_answer(answer: &str) -> Self {
        let answer = answer.trim().to_lowercase();
        if answer.starts_with('s') {
            CollisionPolicy::Skip
        } else if answer.starts_with('r') {
            CollisionPolicy::Rename
        } else {
            CollisionPolicy::Overwrite
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollisionPolicy::Overwrite => "overwrite",
            CollisionPolicy::Skip => "skip",
            CollisionPolicy::Rename => "rename",
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(CollisionPolicy::Overwrite),
            "skip" => Ok(CollisionPolicy::Skip),
            "rename" => Ok(CollisionPolicy::Rename),
            other => Err(format!(
                "无效的冲突策略: {}（可选 overwrite / skip / rename）",
                other
            )),
        }
    }
}

// =====================================================
// 策略选择
// =====================================================

/// 冲突策略询问接口
///
/// 只在存在冲突时调用；实现可以阻塞（调用方会放到阻塞线程中执行）
pub trait CollisionPrompt: Send + Sync {
    fn choose(&self, collision_count: usize, total_count: usize) -> CollisionPolicy;
}

/// 固定策略，不询问
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub CollisionPolicy);

impl CollisionPrompt for FixedPolicy {
    fn choose(&self, _collision_count: usize, _total_count: usize) -> CollisionPolicy {
        self.0
    }
}

/// 终端交互询问
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl CollisionPrompt for StdinPrompt {
    fn choose(&self, collision_count: usize, total_count: usize) -> CollisionPolicy {
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "{}/{} 个文件已存在，请输入 overwrite / skip / rename: ",
            collision_count, total_count
        );
        let _ = stderr.flush();

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => CollisionPolicy::from_answer(&answer),
            // 读取失败等同于空回答
            Err(_) => CollisionPolicy::Overwrite,
        }
    }
}

// =====================================================
// 冲突解析
// =====================================================

/// 统计已存在的 key 数量
pub fn count_collisions(keys: &[String], exists: &HashMap<String, bool>) -> usize {
    keys.iter()
        .filter(|k| exists.get(*k).copied().unwrap_or(false))
        .count()
}

/// 生成第 n 个重命名候选
///
/// 扩展名只看最后一段路径，且不把开头的点当作扩展名分隔：
/// - `photos/a.jpg` -> `photos/a (1).jpg`
/// - `archive.tar.gz` -> `archive.tar (1).gz`
/// - `.env` -> `.env (1)`
/// - `dir.v2/readme` -> `dir.v2/readme (1)`
pub fn renamed_key(key: &str, n: usize) -> String {
    let segment_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    let segment = &key[segment_start..];
    match segment.rfind('.') {
        Some(dot) if dot > 0 => {
            let split = segment_start + dot;
            format!("{} ({}){}", &key[..split], n, &key[split..])
        }
        _ => format!("{} ({})", key, n),
    }
}

/// 按策略处理批次中的 key
///
/// 返回与输入一一对应的结果，`None` 表示该项被跳过。
/// 重命名时候选 key 既不能在存在性结果中，也不能与批次内的
/// 任何原始 key 或已分配的新 key 重复。
pub fn resolve_keys(
    keys: &[String],
    exists: &HashMap<String, bool>,
    policy: CollisionPolicy,
) -> Vec<Option<String>> {
    let collides = |k: &str| exists.get(k).copied().unwrap_or(false);

    match policy {
        CollisionPolicy::Overwrite => keys.iter().cloned().map(Some).collect(),
        CollisionPolicy::Skip => keys
            .iter()
            .map(|k| if collides(k) { None } else { Some(k.clone()) })
            .collect(),
        CollisionPolicy::Rename => {
            let mut used: HashSet<String> = keys.iter().cloned().collect();
            keys.iter()
                .map(|k| {
                    if !collides(k) {
                        return Some(k.clone());
                    }
                    let mut n = 1;
                    let mut candidate = renamed_key(k, n);
                    while collides(&candidate) || used.contains(&candidate) {
                        n += 1;
                        candidate = renamed_key(k, n);
                    }
                    used.insert(candidate.clone());
                    Some(candidate)
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn exists_of(keys: &[&str]) -> HashMap<String, bool> {
        keys.iter().map(|k| (k.to_string(), true)).collect()
    }

    fn owned(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_from_answer() {
        assert_eq!(CollisionPolicy::from_answer("Skip"), CollisionPolicy::Skip);
        assert_eq!(CollisionPolicy::from_answer("  r\n"), CollisionPolicy::Rename);
        assert_eq!(CollisionPolicy::from_answer(""), CollisionPolicy::Overwrite);
        assert_eq!(CollisionPolicy::from_answer("yes"), CollisionPolicy::Overwrite);
    }

    #[test]
    fn test_from_str_is_strict() {
        assert_eq!("RENAME".parse::<CollisionPolicy>(), Ok(CollisionPolicy::Rename));
        assert!("r".parse::<CollisionPolicy>().is_err());
    }

    #[test]
    fn test_renamed_key() {
        assert_eq!(renamed_key("photos/a.jpg", 1), "photos/a (1).jpg");
        assert_eq!(renamed_key("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(renamed_key(".env", 1), ".env (1)");
        assert_eq!(renamed_key("dir.v2/readme", 1), "dir.v2/readme (1)");
        assert_eq!(renamed_key("docs/.hidden", 3), "docs/.hidden (3)");
    }

    #[test]
    fn test_overwrite_keeps_all() {
        let keys = owned(&["a.txt", "b.txt"]);
        let resolved = resolve_keys(&keys, &exists_of(&["a.txt"]), CollisionPolicy::Overwrite);
        assert_eq!(resolved, vec![Some("a.txt".to_string()), Some("b.txt".to_string())]);
    }

    #[test]
    fn test_skip_removes_existing() {
        let keys: Vec<String> = (0..10).map(|i| format!("f{}.txt", i)).collect();
        let exists = exists_of(&["f1.txt", "f4.txt", "f8.txt"]);

        assert_eq!(count_collisions(&keys, &exists), 3);
        let resolved = resolve_keys(&keys, &exists, CollisionPolicy::Skip);
        assert_eq!(resolved.iter().flatten().count(), 7);
        assert!(resolved[1].is_none());
    }

    #[test]
    fn test_rename_avoids_existing_and_batch_keys() {
        // a (1).txt 已存在，a (2).txt 是批次内另一个文件
        let keys = owned(&["a.txt", "a (2).txt"]);
        let exists = exists_of(&["a.txt", "a (1).txt"]);

        let resolved = resolve_keys(&keys, &exists, CollisionPolicy::Rename);
        assert_eq!(
            resolved,
            vec![Some("a (3).txt".to_string()), Some("a (2).txt".to_string())]
        );
    }

    #[test]
    fn test_rename_records_assigned_keys() {
        // 两个不同目录下的文件不会互相影响，同一 key 的重复项依次编号
        let keys = owned(&["x/a.txt", "y/a.txt", "x/a.txt"]);
        let exists = exists_of(&["x/a.txt", "y/a.txt"]);

        let resolved = resolve_keys(&keys, &exists, CollisionPolicy::Rename);
        assert_eq!(
            resolved,
            vec![
                Some("x/a (1).txt".to_string()),
                Some("y/a (1).txt".to_string()),
                Some("x/a (2).txt".to_string()),
            ]
        );
    }

    #[test]
    fn test_fixed_policy_prompt() {
        let prompt = FixedPolicy(CollisionPolicy::Skip);
        assert_eq!(prompt.choose(3, 10), CollisionPolicy::Skip);
    }

    proptest! {
        #[test]
        fn prop_rename_produces_unique_non_existing_keys(
            names in prop::collection::vec("[a-c]{1,2}(\\.[a-z]{1,2})?", 1..30),
            existing in prop::collection::vec("[a-c]{1,2}( \\([1-3]\\))?(\\.[a-z]{1,2})?", 0..30),
        ) {
            let keys: Vec<String> = names;
            let exists: HashMap<String, bool> =
                existing.into_iter().map(|k| (k, true)).chain(keys.iter().map(|k| (k.clone(), true))).collect();

            let resolved = resolve_keys(&keys, &exists, CollisionPolicy::Rename);
            let finals: Vec<String> = resolved.into_iter().flatten().collect();
            prop_assert_eq!(finals.len(), keys.len());

            let mut seen = HashSet::new();
            for key in &finals {
                prop_assert!(!exists.get(key).copied().unwrap_or(false));
                prop_assert!(seen.insert(key.clone()));
            }
        }
    }
}
