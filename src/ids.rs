use uuid::Uuid;

pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// 24 lowercase hex chars, the width of a document-store object id.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn new_id(&self) -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(24);
        id
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::IdGenerator;

    #[derive(Debug, Default)]
    pub struct SequentialIds {
        next: AtomicU64,
    }

    impl IdGenerator for SequentialIds {
        fn new_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            format!("id-{n:04}")
        }
    }
}
