//! Promise: the future returned by every invocation
//!
//! A [`Promise`] is an ordinary `Future` with two extra capabilities bound
//! to the invocation that produced it: [`Promise::terminate`] and
//! [`Promise::notify`]. Every combinator returns a new `Promise` that
//! refers to the same invocation, so the capabilities survive arbitrarily
//! long chains.
//!
//! Promises are lazy in the usual Rust way: the input is delivered to the
//! isolate on the first poll (or on [`Promise::start`]). Subscribers
//! attached before that point observe every notification.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use super::controller::{Invocation, InvocationId, Outcome, Owner, Phase};
use super::error::{InvocationError, InvocationResult, IsolateFault};

/// Future of an invocation's outcome, with termination and notifications
#[must_use = "promises do nothing unless polled or started"]
pub struct Promise<T> {
    owner: Arc<Owner>,
    inner: BoxFuture<'static, InvocationResult<T>>,
}

impl<T> Promise<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn settling(
        invocation: Arc<Invocation>,
        settled: oneshot::Receiver<Outcome>,
    ) -> Self {
        let owner = Arc::new(Owner::new(Arc::clone(&invocation)));
        let inner = async move {
            invocation.start();
            let outcome = settled.await.unwrap_or_else(|_| {
                Outcome::Rejected(InvocationError::Fault(IsolateFault::new(
                    invocation.name(),
                    "invocation dropped before settling",
                )))
            });
            outcome.into_result()
        }
        .boxed();
        Self { owner, inner }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Identifier of the underlying invocation
    pub fn id(&self) -> InvocationId {
        *self.owner.invocation().id()
    }

    /// Current lifecycle phase of the underlying invocation
    pub fn phase(&self) -> Phase {
        self.owner.invocation().phase()
    }

    /// Whether the underlying invocation has settled
    pub fn is_settled(&self) -> bool {
        self.owner.invocation().is_settled()
    }

    /// Deliver the input now instead of on first poll
    pub fn start(&self) {
        self.owner.invocation().start();
    }

    /// Forcibly release the isolate.
    ///
    /// Rejects with [`InvocationError::Terminated`] unless the invocation
    /// already settled; calling it again, or after settlement, does nothing.
    /// Work already done inside the isolate is discarded.
    pub fn terminate(&self) {
        self.owner.invocation().terminate();
    }

    /// Receive every notification sent after this call, in send order.
    ///
    /// The invocation keeps its callbacks until it settles, so a callback
    /// that owns a [`Promise`] or [`InvocationHandle`] of the same invocation
    /// keeps it running after every other handle is dropped. Capture a
    /// [`WeakInvocationHandle`] instead.
    pub fn notify<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        subscribe(self.owner.invocation(), callback)
    }

    /// Cloneable handle to the same invocation, usable while this promise
    /// is being awaited
    pub fn handle(&self) -> InvocationHandle {
        InvocationHandle {
            owner: Arc::clone(&self.owner),
        }
    }

    /// Continue with the outcome, whichever it is
    pub fn then<U, F, Fut>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(InvocationResult<T>) -> Fut + Send + 'static,
        Fut: Future<Output = InvocationResult<U>> + Send + 'static,
    {
        let Self { owner, inner } = self;
        Promise {
            owner,
            inner: async move { f(inner.await).await }.boxed(),
        }
    }

    /// Continue with the value when the invocation resolves
    pub fn and_then<U, F, Fut>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = InvocationResult<U>> + Send + 'static,
    {
        let Self { owner, inner } = self;
        Promise {
            owner,
            inner: async move {
                match inner.await {
                    Ok(value) => f(value).await,
                    Err(err) => Err(err),
                }
            }
            .boxed(),
        }
    }

    /// Transform the resolved value
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let Self { owner, inner } = self;
        Promise {
            owner,
            inner: inner.map(move |result| result.map(f)).boxed(),
        }
    }

    /// Recover from a rejection
    pub fn catch<F, Fut>(self, f: F) -> Promise<T>
    where
        F: FnOnce(InvocationError) -> Fut + Send + 'static,
        Fut: Future<Output = InvocationResult<T>> + Send + 'static,
    {
        let Self { owner, inner } = self;
        Promise {
            owner,
            inner: async move {
                match inner.await {
                    Ok(value) => Ok(value),
                    Err(err) => f(err).await,
                }
            }
            .boxed(),
        }
    }

    /// Transform the rejection
    pub fn map_err<F>(self, f: F) -> Promise<T>
    where
        F: FnOnce(InvocationError) -> InvocationError + Send + 'static,
    {
        let Self { owner, inner } = self;
        Promise {
            owner,
            inner: inner.map(move |result| result.map_err(f)).boxed(),
        }
    }
}

impl<T> Future for Promise<T> {
    type Output = InvocationResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let invocation = self.owner.invocation();
        f.debug_struct("Promise")
            .field("id", invocation.id())
            .field("phase", &invocation.phase())
            .finish_non_exhaustive()
    }
}

/// Handle to an invocation that does not carry its outcome
#[derive(Clone)]
pub struct InvocationHandle {
    owner: Arc<Owner>,
}

impl InvocationHandle {
    /// Identifier of the invocation
    pub fn id(&self) -> InvocationId {
        *self.owner.invocation().id()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.owner.invocation().phase()
    }

    /// Whether the invocation has settled
    pub fn is_settled(&self) -> bool {
        self.owner.invocation().is_settled()
    }

    /// Deliver the input now
    pub fn start(&self) {
        self.owner.invocation().start();
    }

    /// See [`Promise::terminate`]
    pub fn terminate(&self) {
        self.owner.invocation().terminate();
    }

    /// See [`Promise::notify`]
    pub fn notify<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        subscribe(self.owner.invocation(), callback)
    }

    /// Handle that does not count towards keeping the invocation alive
    pub fn downgrade(&self) -> WeakInvocationHandle {
        WeakInvocationHandle {
            owner: Arc::downgrade(&self.owner),
        }
    }
}

/// Non-owning handle to an invocation.
///
/// Meant for notification callbacks: once every [`Promise`] and
/// [`InvocationHandle`] is gone the invocation is terminated, and this
/// handle stops upgrading.
#[derive(Debug, Clone)]
pub struct WeakInvocationHandle {
    owner: Weak<Owner>,
}

impl WeakInvocationHandle {
    /// Owning handle, if some caller still holds the invocation
    pub fn upgrade(&self) -> Option<InvocationHandle> {
        self.owner.upgrade().map(|owner| InvocationHandle { owner })
    }

    /// Terminate the invocation if a caller still holds it
    pub fn terminate(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.invocation().terminate();
        }
    }
}

impl fmt::Debug for InvocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationHandle")
            .field("id", self.owner.invocation().id())
            .finish_non_exhaustive()
    }
}

/// A registered notification callback
#[derive(Debug)]
pub struct Subscription {
    invocation: Weak<Invocation>,
    id: u64,
}

impl Subscription {
    /// Stop delivering notifications to this callback.
    ///
    /// Other subscribers and the invocation's outcome are unaffected.
    /// Returns false if the callback was no longer registered.
    pub fn unsubscribe(self) -> bool {
        self.invocation
            .upgrade()
            .is_some_and(|invocation| invocation.unsubscribe(self.id))
    }
}

fn subscribe<F>(invocation: &Arc<Invocation>, callback: F) -> Subscription
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    let id = invocation.subscribe(Arc::new(callback));
    Subscription {
        invocation: Arc::downgrade(invocation),
        id,
    }
}
