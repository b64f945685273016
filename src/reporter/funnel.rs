use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{Error, Result};

/// Capacity of the merged output channel.
const OUTPUT_CAPACITY: usize = 16;

/// Multiplexes a changing set of input channels into one output channel.
///
/// Inputs may be added after merging has started. The output closes once the
/// funnel's token is cancelled and every input registered so far has closed;
/// after that, [`add_input`](Self::add_input) fails with [`Error::FunnelClosed`].
///
/// Once a terminal item has been forwarded, items from every input are dropped.
pub(crate) struct EventFunnel<T> {
    state: Arc<Mutex<FunnelState<T>>>,
    done: CancellationToken,
    is_terminal: fn(&T) -> bool,
}

struct FunnelState<T> {
    /// Number of inputs still draining.
    inputs: usize,
    cancelled: bool,
    /// A terminal item was forwarded.
    terminated: bool,
    /// Dropped when the funnel closes, so that the output closes with it.
    output: Option<mpsc::Sender<T>>,
}

impl<T: Send + 'static> EventFunnel<T> {
    /// Creates a funnel bound to `token`, returning the merged output.
    #[cfg(test)]
    pub(crate) fn new(token: CancellationToken) -> (Self, mpsc::Receiver<T>) {
        Self::with_terminal(token, |_| false)
    }

    /// Creates a funnel bound to `token` that forwards nothing after the first
    /// item for which `is_terminal` holds.
    pub(crate) fn with_terminal(
        token: CancellationToken,
        is_terminal: fn(&T) -> bool,
    ) -> (Self, mpsc::Receiver<T>) {
        let (output, receiver) = mpsc::channel(OUTPUT_CAPACITY);
        let state = Arc::new(Mutex::new(FunnelState {
            inputs: 0,
            cancelled: false,
            terminated: false,
            output: Some(output),
        }));
        let done = CancellationToken::new();

        tokio::spawn({
            let state = Arc::clone(&state);
            let done = done.clone();
            async move {
                token.cancelled().await;
                let mut state = state.lock();
                state.cancelled = true;
                if state.inputs == 0 {
                    close(&mut state, &done);
                }
            }
        });

        (
            Self {
                state,
                done,
                is_terminal,
            },
            receiver,
        )
    }

    /// Registers another input whose items are forwarded to the output.
    pub(crate) fn add_input(&self, mut input: mpsc::Receiver<T>) -> Result<()> {
        let output = {
            let mut state = self.state.lock();
            let Some(output) = state.output.clone() else {
                return Err(Error::FunnelClosed);
            };
            state.inputs += 1;
            output
        };

        let state = Arc::clone(&self.state);
        let done = self.done.clone();
        let is_terminal = self.is_terminal;
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                // Nobody is reading the output anymore; keep draining so
                // that the producer never blocks.
                let Ok(permit) = output.reserve().await else {
                    continue;
                };
                // Enqueue under the lock so that nothing lands behind a terminal item.
                let mut guard = state.lock();
                if guard.terminated {
                    continue;
                }
                guard.terminated = is_terminal(&item);
                permit.send(item);
            }
            drop(output);

            let mut state = state.lock();
            state.inputs -= 1;
            if state.cancelled && state.inputs == 0 {
                close(&mut state, &done);
            }
        });
        Ok(())
    }

    /// Resolves once the output has been closed.
    pub(crate) fn done(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }
}

fn close<T>(state: &mut FunnelState<T>, done: &CancellationToken) {
    if state.output.take().is_some() {
        log::trace!("Closing event funnel");
        done.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::timeout};
    use tokio_util::sync::CancellationToken;

    use super::EventFunnel;
    use crate::Error;

    #[tokio::test(start_paused = true)]
    async fn stays_open_without_inputs_until_cancelled() {
        let token = CancellationToken::new();
        let (funnel, mut output) = EventFunnel::<u32>::new(token.clone());

        assert!(timeout(Duration::from_secs(1), output.recv()).await.is_err());

        token.cancel();
        assert_eq!(output.recv().await, None);
        funnel.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_last_input_closes() {
        let token = CancellationToken::new();
        let (funnel, mut output) = EventFunnel::new(token.clone());

        let (tx1, rx1) = mpsc::channel(1);
        let (tx2, rx2) = mpsc::channel(1);
        funnel.add_input(rx1).unwrap();
        funnel.add_input(rx2).unwrap();

        tx1.send(1).await.unwrap();
        assert_eq!(output.recv().await, Some(1));

        token.cancel();
        drop(tx1);

        // The second input is still live, so the output stays open.
        tx2.send(2).await.unwrap();
        assert_eq!(output.recv().await, Some(2));
        assert!(timeout(Duration::from_secs(1), output.recv()).await.is_err());

        drop(tx2);
        assert_eq!(output.recv().await, None);
        funnel.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn inputs_added_after_merge_started_are_forwarded() {
        let token = CancellationToken::new();
        let (funnel, mut output) = EventFunnel::new(token.clone());

        let (tx1, rx1) = mpsc::channel(1);
        funnel.add_input(rx1).unwrap();
        tx1.send("first").await.unwrap();
        assert_eq!(output.recv().await, Some("first"));

        let (tx2, rx2) = mpsc::channel(1);
        funnel.add_input(rx2).unwrap();
        tx2.send("second").await.unwrap();
        assert_eq!(output.recv().await, Some("second"));

        token.cancel();
        drop((tx1, tx2));
        assert_eq!(output.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_items_after_terminal_item() {
        let token = CancellationToken::new();
        let (funnel, mut output) = EventFunnel::with_terminal(token.clone(), |item: &i32| *item < 0);

        let (tx1, rx1) = mpsc::channel(4);
        let (tx2, rx2) = mpsc::channel(4);
        funnel.add_input(rx1).unwrap();
        funnel.add_input(rx2).unwrap();

        tx1.send(1).await.unwrap();
        assert_eq!(output.recv().await, Some(1));
        tx1.send(-1).await.unwrap();
        assert_eq!(output.recv().await, Some(-1));

        // Both inputs keep draining, but nothing follows the terminal item.
        tx2.send(2).await.unwrap();
        tx1.send(-2).await.unwrap();
        tx2.send(3).await.unwrap();

        token.cancel();
        drop((tx1, tx2));
        assert_eq!(output.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_inputs_once_closed() {
        let token = CancellationToken::new();
        let (funnel, mut output) = EventFunnel::<u32>::new(token.clone());
        token.cancel();
        funnel.done().await;
        assert_eq!(output.recv().await, None);

        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(funnel.add_input(rx), Err(Error::FunnelClosed)));
    }
}
