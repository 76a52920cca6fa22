//! One-time initialization flags backing `builtin "once"`

use std::sync::atomic::{AtomicU8, Ordering};

const INCOMPLETE: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

/// Outcome of trying to claim a flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceClaim {
    /// Caller must run the initializer and then call `complete`
    Run,
    /// Already initialized
    Done,
    /// Another caller is running the initializer
    InProgress,
}

#[derive(Debug, Default)]
pub struct OnceFlag {
    state: AtomicU8,
}

impl OnceFlag {
    pub fn new() -> Self {
        OnceFlag::default()
    }

    pub fn claim(&self) -> OnceClaim {
        match self
            .state
            .compare_exchange(INCOMPLETE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => OnceClaim::Run,
            Err(COMPLETE) => OnceClaim::Done,
            Err(_) => OnceClaim::InProgress,
        }
    }

    pub fn complete(&self) {
        self.state.store(COMPLETE, Ordering::Release);
    }

    /// Give the flag back after a failed initializer
    pub fn abandon(&self) {
        self.state.store(INCOMPLETE, Ordering::Release);
    }

    /// Spin until the running initializer finishes; false if it was abandoned
    pub fn wait(&self) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                RUNNING => std::hint::spin_loop(),
                state => return state == COMPLETE,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_claim_sequence() {
        let flag = OnceFlag::new();
        assert_eq!(flag.claim(), OnceClaim::Run);
        assert_eq!(flag.claim(), OnceClaim::InProgress);
        flag.complete();
        assert_eq!(flag.claim(), OnceClaim::Done);
        assert!(flag.wait());
    }

    #[test]
    fn test_abandoned_flag_can_be_claimed_again() {
        let flag = OnceFlag::new();
        assert_eq!(flag.claim(), OnceClaim::Run);
        flag.abandon();
        assert!(!flag.wait());
        assert_eq!(flag.claim(), OnceClaim::Run);
    }

    #[test]
    fn test_initializer_runs_once_across_threads() {
        let flag = Arc::new(OnceFlag::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = Arc::clone(&flag);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || match flag.claim() {
                    OnceClaim::Run => {
                        runs.fetch_add(1, Ordering::SeqCst);
                        flag.complete();
                    }
                    OnceClaim::Done => {}
                    OnceClaim::InProgress => assert!(flag.wait()),
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flag.is_complete());
    }
}
