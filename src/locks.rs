//! 키 단위 락 테이블
//!
//! 같은 키에 대한 작업만 직렬화하고, 서로 다른 키는 서로를 막지 않습니다.
//! 사용이 끝난 키의 락은 테이블에서 제거됩니다.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `key`의 락을 잡은 상태로 `f` 실행
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };

        drop(lock);
        // 테이블 외에 아무도 참조하지 않으면 제거
        self.locks
            .remove_if(key, |_, held| Arc::strong_count(held) == 1);

        result
    }

    /// 현재 테이블에 남아 있는 키 수
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
