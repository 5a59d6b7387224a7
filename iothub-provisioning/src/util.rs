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

use crate::error::Result;

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

pub(crate) fn respond<T>(responder: Responder<T>, result: Result<T>) {
    let _ = responder.send(result);
}

/// A one-shot timer that stays pending until armed. Firing disarms it.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    delay: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn arm(&mut self, duration: Duration) {
        self.delay = Some(Box::pin(tokio::time::sleep_until(
            Instant::now() + duration,
        )));
    }

    pub fn cancel(&mut self) {
        self.delay = None;
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
