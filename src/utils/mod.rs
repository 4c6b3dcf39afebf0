pub mod chunks {
    pub struct Chunks<I: Iterator> {
        iter: Option<I>,
        chunk_size: usize,
    }

    impl<I: Iterator> Iterator for Chunks<I> {
        type Item = Vec<I::Item>;

        fn next(&mut self) -> Option<Self::Item> {
            if let Some(ref mut iter) = self.iter {
                let mut chunk = Vec::with_capacity(self.chunk_size);
                loop {
                    if chunk.len() == self.chunk_size {
                        return Some(chunk);
                    }
                    if let Some(item) = iter.next() {
                        chunk.push(item);
                    } else {
                        self.iter = None;
                        if chunk.is_empty() {
                            return None;
                        }
                        return Some(chunk);
                    }
                }
            }
            None
        }
    }

    pub trait ToChunks: Iterator + Sized {
        fn chunks_from_iter(self, chunk_size: usize) -> Chunks<Self> {
            assert!(chunk_size > 0);
            Chunks {
                iter: Some(self),
                chunk_size,
            }
        }
    }

    impl<I: Iterator> ToChunks for I {}

    #[test]
    fn chunks_test() {
        let vals = vec![1, 2, 3, 4, 5];
        let result = vals.into_iter().chunks_from_iter(2).collect::<Vec<_>>();
        assert_eq!(result, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn chunks_of_exact_multiple_have_no_empty_tail() {
        let vals = vec![1, 2, 3, 4];
        let result = vals.into_iter().chunks_from_iter(2).collect::<Vec<_>>();
        assert_eq!(result, vec![vec![1, 2], vec![3, 4]]);
        let empty: Vec<i32> = vec![];
        assert_eq!(empty.into_iter().chunks_from_iter(3).count(), 0);
    }

    #[test]
    #[should_panic]
    fn chunks_invalid_size_test() {
        let vals = vec![1, 2];
        let _ = vals.into_iter().chunks_from_iter(0).collect::<Vec<_>>();
    }
}

pub mod retry {
    use std::future::Future;
    use std::time::Duration;
    use tokio::time::sleep;
    use wavesexchange_log::warn;

    use crate::error::Error;

    /// Runs `f` up to `attempts` times, doubling the delay after every retryable failure.
    pub async fn with_backoff<T, F, Fut>(
        what: &str,
        attempts: u32,
        initial_delay: Duration,
        mut f: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 1;
        let mut delay = initial_delay;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(
                        "{} failed (attempt #{}), retrying in {:?}: {}",
                        what, attempt, delay, err
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

}
