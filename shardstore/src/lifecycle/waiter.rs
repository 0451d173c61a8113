use crate::Error;
use futures::channel::oneshot;

/// A caller awaiting the outcome of an operation.
///
/// Resolving consumes the waiter, so every waiter is resolved at most once.
pub struct Waiter<T> {
    responder: oneshot::Sender<Result<T, Error>>,
}

impl<T> Waiter<T> {
    pub fn new(responder: oneshot::Sender<Result<T, Error>>) -> Self {
        Self { responder }
    }

    /// Deliver `result` to the caller.
    ///
    /// If the caller is no longer listening, the undelivered result is returned so that any
    /// resources it holds can be reclaimed.
    pub fn resolve(self, result: Result<T, Error>) -> Result<(), Result<T, Error>> {
        self.responder.send(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_resolve_delivers_once() {
        let (sender, receiver) = oneshot::channel::<Result<u8, Error>>();
        let waiter = Waiter::new(sender);
        assert!(waiter.resolve(Ok(3)).is_ok());
        assert_eq!(block_on(receiver).unwrap(), Ok(3));
    }

    #[test]
    fn test_resolve_returns_undelivered() {
        let (sender, receiver) = oneshot::channel::<Result<u8, Error>>();
        drop(receiver);
        let waiter = Waiter::new(sender);
        assert_eq!(waiter.resolve(Ok(3)), Err(Ok(3)));
    }
}
