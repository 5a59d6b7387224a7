//! Common utilities

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::oneshot,
    time::{Instant, Sleep},
};

use crate::error::{Error, Result};

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Completes a responder. A receiver that has gone away is not an error.
pub(crate) fn respond<T>(responder: Responder<T>, result: Result<T>) {
    let _ = responder.send(result);
}

pub(crate) fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// A one-shot timer that never fires unless armed
///
/// Firing disarms the timer, so a stale expiry can never be observed twice.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    delay: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn never() -> Self {
        Self { delay: None }
    }

    pub fn arm(&mut self, duration: Duration) {
        self.delay = Some(Box::pin(tokio::time::sleep_until(
            Instant::now() + duration,
        )));
    }

    pub fn cancel(&mut self) {
        self.delay = None;
    }

    pub fn is_armed(&self) -> bool {
        self.delay.is_some()
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.delay.as_mut() {
            Some(delay) => match delay.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.delay = None;
                    Poll::Ready(())
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

/// Waits on an optional timer, pending forever if there is none
pub(crate) async fn fire(timer: Option<&mut Timer>) {
    match timer {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

/// The eventual result of an operation handed to an engine
///
/// The input is submitted to the engine when the operation is called, not when the
/// returned future is first polled, so inputs are processed in call order.
#[derive(Debug)]
#[must_use = "the operation has been submitted; await the completion to observe its result"]
pub struct Completion<T> {
    inner: std::result::Result<oneshot::Receiver<Result<T>>, Option<Error>>,
}

impl<T> Completion<T> {
    pub(crate) fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { inner: Ok(rx) }
    }

    pub(crate) fn failed(error: Error) -> Self {
        Self {
            inner: Err(Some(error)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Ok(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(Error::EngineStopped))),
            Err(error) => Poll::Ready(Err(error.take().unwrap_or(Error::EngineStopped))),
        }
    }
}

/// Result of an internal completion, checked without waiting
pub(crate) enum Outcome<T> {
    Pending,
    Done(Result<T>),
}

pub(crate) fn try_outcome<T>(rx: &mut oneshot::Receiver<Result<T>>) -> Outcome<T> {
    match rx.try_recv() {
        Ok(result) => Outcome::Done(result),
        Err(oneshot::error::TryRecvError::Empty) => Outcome::Pending,
        Err(oneshot::error::TryRecvError::Closed) => Outcome::Done(Err(Error::EngineStopped)),
    }
}
