use tokio::sync::watch;

/// Awaitable boolean latch (`running` / `loaded` / `stopped`).
#[derive(Debug)]
pub struct Flag {
    tx: watch::Sender<bool>,
}

impl Flag {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn set(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(false);
    }

    /// Set the flag; `true` only for the caller that flipped it.
    pub(crate) fn set_if_unset(&self) -> bool {
        self.tx.send_if_modified(|value| {
            if *value {
                false
            } else {
                *value = true;
                true
            }
        })
    }

    /// Wait until the flag is set (returns at once if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|value| *value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_when_set() {
        let flag = Arc::new(Flag::new(false));
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        flag.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_if_unset_only_once() {
        let flag = Flag::new(false);
        assert!(flag.set_if_unset());
        assert!(!flag.set_if_unset());
        assert!(flag.is_set());

        flag.clear();
        assert!(!flag.is_set());
    }

    #[tokio::test]
    async fn test_wait_on_already_set() {
        let flag = Flag::new(true);
        tokio::time::timeout(Duration::from_millis(100), flag.wait())
            .await
            .unwrap();
    }
}
